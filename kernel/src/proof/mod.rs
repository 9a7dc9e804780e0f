//! Proof module: canonical hashing and canonical JSON.
//!
//! Nothing in `proof` depends on `carrier`.

pub mod canon;
pub mod hash;
pub mod hash_domain;
