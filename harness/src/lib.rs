//! Patchtree Harness: host-side pieces around the search engine.
//!
//! The harness does NOT implement search logic; it supplies what a host
//! process needs to drive the engine: a durable directory-backed checkpoint
//! store, deterministic collaborator worlds for tests and benches, and a
//! runner that takes a session to a terminal state.

#![forbid(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]

pub mod dir_store;
pub mod runner;
pub mod worlds;
