//! Deterministic collaborator worlds for tests, benches and demos.

pub mod fanout;
pub mod scripted;
