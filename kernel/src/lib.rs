//! Patchtree Kernel: content identity for candidate patches.
//!
//! # API Surface
//!
//! - [`carrier::patch::Patch`] -- the opaque patch payload (bytes + string metadata)
//! - [`proof::hash::canonical_hash`] -- domain-separated SHA-256 content hashing
//! - [`proof::canon::canonical_json_bytes`] -- the single canonical JSON encoder
//!
//! # Module Dependency Direction
//!
//! `proof` ← `carrier`
//!
//! `carrier` hashes through `proof`; `proof` depends on nothing internal.
//! The kernel performs no I/O and holds no shared state.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod carrier;
pub mod proof;
