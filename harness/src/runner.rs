//! Harness runner: drives one session to a terminal state and reports on it.
//!
//! The runner uses ONLY the coordinator's public operations. It does not
//! implement any search logic itself.
//!
//! # Pipeline
//!
//! ```text
//! start() -> wait(timeout) -> [abort() on timeout]
//!   -> status() + best_patch() + best_path() -> RunReport
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use patchtree_kernel::proof::hash::ContentHash;
use patchtree_search::config::{EngineConfig, SessionBudget};
use patchtree_search::contract::ProblemStatement;
use patchtree_search::coordinator::Coordinator;
use patchtree_search::error::EngineError;
use patchtree_search::node::NodeId;
use patchtree_search::session::{BestPatch, SessionId, SessionState};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("cannot read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The session did not finish in time and was aborted.
    #[error("session {session} did not finish in time; aborted as {state}")]
    Timeout {
        session: SessionId,
        state: SessionState,
    },
}

/// Outcome of one harness run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub session: SessionId,
    pub state: SessionState,
    pub nodes_explored: u64,
    pub nodes_total: usize,
    pub best_score: Option<f64>,
    /// Digest of the best `terminal-success` patch, if any.
    pub best_patch: Option<ContentHashHex>,
    /// Root-to-best node ids. Empty when nothing succeeded.
    pub best_path: Vec<NodeId>,
    #[serde(serialize_with = "as_millis")]
    pub elapsed: Duration,
}

/// Hex rendering of a [`ContentHash`] for reports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ContentHashHex(String);

impl From<&ContentHash> for ContentHashHex {
    fn from(hash: &ContentHash) -> Self {
        Self(hash.hex_digest())
    }
}

impl RunReport {
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.state == SessionState::Completed && self.best_patch.is_some()
    }

    /// Pretty JSON summary.
    ///
    /// # Errors
    ///
    /// Only if serialization itself fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }
}

fn as_millis<S: serde::Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u128(d.as_millis())
}

/// Start `problem`, wait up to `timeout` for a terminal state, and report.
///
/// A session still live at the deadline is aborted so its tasks stop, and
/// the call fails with [`HarnessError::Timeout`].
///
/// # Errors
///
/// [`HarnessError::Engine`] if the engine rejects an operation, and
/// [`HarnessError::Timeout`] as above.
pub async fn run_session(
    coordinator: &Coordinator,
    problem: ProblemStatement,
    budget: SessionBudget,
    timeout: Duration,
) -> Result<RunReport, HarnessError> {
    let reference = problem.reference.clone();
    let session = coordinator.start(problem, budget)?;
    tracing::info!(session = %session, problem = %reference, "harness run started");

    let state = coordinator.wait(session, timeout).await?;
    if !state.is_terminal() {
        tracing::warn!(session = %session, state = %state, ?timeout, "harness run timed out");
        let state = coordinator.abort(session).await?;
        return Err(HarnessError::Timeout { session, state });
    }

    let report = report(coordinator, session)?;
    tracing::info!(
        session = %session,
        state = %report.state,
        nodes_explored = report.nodes_explored,
        best_score = ?report.best_score,
        "harness run finished"
    );
    Ok(report)
}

/// Build a report for any known session, live or finished.
///
/// # Errors
///
/// [`HarnessError::Engine`] for an unknown session.
pub fn report(coordinator: &Coordinator, session: SessionId) -> Result<RunReport, HarnessError> {
    let status = coordinator.status(session)?;
    let best_patch = match coordinator.best_patch(session)? {
        BestPatch::Found { patch, .. } => Some(ContentHashHex::from(&patch.content_hash())),
        BestPatch::NoneFound => None,
    };
    Ok(RunReport {
        session,
        state: status.state,
        nodes_explored: status.nodes_explored,
        nodes_total: status.nodes_total,
        best_score: status.best_score,
        best_patch,
        best_path: coordinator.best_path(session)?,
        elapsed: status.elapsed,
    })
}

/// Load an engine config from a TOML file.
///
/// # Errors
///
/// [`HarnessError::Io`] if the file cannot be read, otherwise whatever
/// [`EngineConfig::from_toml_str`] rejects.
pub fn load_engine_config(path: &Path) -> Result<EngineConfig, HarnessError> {
    let text = std::fs::read_to_string(path).map_err(|source| HarnessError::Io {
        path: path.to_owned(),
        source,
    })?;
    let config = EngineConfig::from_toml_str(&text)?;
    tracing::debug!(path = %path.display(), "engine config loaded");
    Ok(config)
}
