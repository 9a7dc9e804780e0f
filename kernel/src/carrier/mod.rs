//! Carrier module: the patch payload handed between generator, evaluator, and engine.

pub mod patch;
