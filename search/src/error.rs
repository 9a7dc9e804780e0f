//! Typed engine errors.
//!
//! Store conflicts and lease loss are recovered inside the engine (a worker
//! that loses a race discards its result). Only [`EngineError`] crosses the
//! public coordinator surface, and "no candidate yet" is never an error.

use thiserror::Error;

use crate::checkpoint::{CheckpointId, CheckpointParseError, CheckpointWriteError};
use crate::checkpoint_store::CheckpointStoreError;
use crate::node::{ClaimToken, NodeId, NodeStatus, WorkerId};
use crate::session::{SessionId, SessionState};

/// Failure of a node store operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("node {0} not found")]
    NotFound(NodeId),

    #[error("parent node {0} does not exist")]
    UnknownParent(NodeId),

    /// Compare-and-swap lost: the stored status was not the expected one.
    #[error("status conflict on node {node}: expected {expected}, found {actual}")]
    Conflict {
        node: NodeId,
        expected: NodeStatus,
        actual: NodeStatus,
    },

    /// The claim token no longer owns the node (expired, revoked, or pruned).
    #[error("claim {token} on node {node} is no longer held")]
    LeaseLost { node: NodeId, token: ClaimToken },

    /// The worker releasing or renewing a lease does not hold one on the node.
    #[error("worker {worker} holds no lease on node {node}")]
    NotLeased { node: NodeId, worker: WorkerId },

    #[error("illegal transition {from} -> {to} on node {node}")]
    IllegalTransition {
        node: NodeId,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("root node already exists ({0})")]
    RootExists(NodeId),
}

/// Failure reported by an external collaborator.
///
/// Either variant is treated as "unable to score" and retried through the
/// lease path; it never fails the session.
#[derive(Debug, Error)]
pub enum ExternalError {
    #[error("patch generator failed")]
    Generator(#[source] anyhow::Error),

    #[error("patch evaluator failed")]
    Evaluator(#[source] anyhow::Error),
}

impl ExternalError {
    pub fn generator(err: impl Into<anyhow::Error>) -> Self {
        Self::Generator(err.into())
    }

    pub fn evaluator(err: impl Into<anyhow::Error>) -> Self {
        Self::Evaluator(err.into())
    }
}

/// Errors returned by the coordinator's public operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("unknown session {0}")]
    UnknownSession(SessionId),

    #[error("session {0} is still active")]
    SessionActive(SessionId),

    #[error("session {session} is {state}")]
    SessionTerminal {
        session: SessionId,
        state: SessionState,
    },

    #[error("cannot {op} session {session} while {state}")]
    InvalidState {
        session: SessionId,
        state: SessionState,
        op: &'static str,
    },

    #[error("sessions must be started from within a Tokio runtime")]
    NoRuntime,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("checkpoint encoding failed: {0}")]
    CheckpointWrite(#[from] CheckpointWriteError),

    #[error("checkpoint {id} is corrupt: {source}")]
    CheckpointParse {
        id: CheckpointId,
        #[source]
        source: CheckpointParseError,
    },

    #[error(transparent)]
    CheckpointStore(#[from] CheckpointStoreError),

    #[error("no valid checkpoint for session {0}")]
    NoValidCheckpoint(SessionId),

    #[error("invalid engine config: {0}")]
    InvalidConfig(String),

    #[error("cannot parse engine config: {0}")]
    Config(#[from] toml::de::Error),
}
