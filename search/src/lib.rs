//! Patchtree Search: a concurrent, checkpointed search tree over candidate patches.
//!
//! This crate is the engine. It depends only on `patchtree_kernel` and never
//! on `patchtree_harness`; generators, evaluators and durable stores are
//! plugged in through traits.
//!
//! # Crate dependency graph
//!
//! ```text
//! patchtree_kernel  <-  patchtree_search  <-  patchtree_harness
//! (hashing, patch)      (engine)              (dir store, worlds, runner)
//! ```
//!
//! # Key types
//!
//! - [`coordinator::Coordinator`]: session lifecycle and the control surface
//! - [`store::NodeStore`]: append-only node arena with dedup and CAS transitions
//! - [`frontier::Frontier`]: best-first queue with time-bounded leases
//! - [`pruner::Pruner`] and [`scorer::ScoreAdapter`]: the pure policy pieces
//! - [`checkpoint_writer`] / [`checkpoint_reader`]: hash-chained snapshot format
//! - [`checkpoint_store::CheckpointStore`]: where snapshot bytes go

#![forbid(unsafe_code)]

pub mod checkpoint;
pub mod checkpoint_reader;
pub mod checkpoint_store;
pub mod checkpoint_writer;
pub mod config;
pub mod contract;
pub mod coordinator;
pub mod error;
pub mod frontier;
pub mod node;
pub mod pruner;
pub mod scorer;
pub mod session;
pub mod store;
