//! Session identity, lifecycle state, and the per-session runtime record.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use patchtree_kernel::carrier::patch::Patch;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::SessionBudget;
use crate::contract::ProblemStatement;
use crate::frontier::Frontier;
use crate::node::NodeId;
use crate::pruner::BudgetView;
use crate::store::NodeStore;

/// Session identifier (UUID v4).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionId({})", self.0)
    }
}

impl FromStr for SessionId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Session lifecycle.
///
/// ```text
/// created -> running <-> paused
/// running -> completed | failed | aborted
/// paused  -> failed | aborted
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Aborted,
}

impl SessionState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Answer to `status(session)`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub session: SessionId,
    pub state: SessionState,
    /// Distinct nodes claimed so far (the node budget's unit).
    pub nodes_explored: u64,
    /// Queued, unleased frontier entries.
    pub frontier_size: usize,
    pub leased: usize,
    /// Nodes in the store, whatever their status.
    pub nodes_total: usize,
    pub best_score: Option<f64>,
    /// Active (non-paused) wall-clock time.
    pub elapsed: Duration,
}

/// One row of `list()`.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    pub session: SessionId,
    pub state: SessionState,
    pub problem_reference: String,
    pub created_at_ms: u64,
    pub nodes_explored: u64,
    pub best_score: Option<f64>,
}

/// Answer to `best_patch(session)`.
#[derive(Debug, Clone, PartialEq)]
pub enum BestPatch {
    Found {
        node: NodeId,
        patch: Patch,
        score: f64,
    },
    /// No `terminal-success` node yet. An expected state, not an error.
    NoneFound,
}

impl BestPatch {
    #[must_use]
    pub fn patch(&self) -> Option<&Patch> {
        match self {
            Self::Found { patch, .. } => Some(patch),
            Self::NoneFound => None,
        }
    }
}

/// Accumulates active time across pauses.
#[derive(Debug, Clone, Copy)]
struct SessionClock {
    accumulated: Duration,
    running_since: Option<Instant>,
}

impl SessionClock {
    fn elapsed(&self) -> Duration {
        self.accumulated + self.running_since.map_or(Duration::ZERO, |t| t.elapsed())
    }

    fn stop(&mut self) {
        if let Some(since) = self.running_since.take() {
            self.accumulated += since.elapsed();
        }
    }

    fn start(&mut self) {
        if self.running_since.is_none() {
            self.running_since = Some(Instant::now());
        }
    }
}

/// Runtime record of one session, shared by its worker, reaper and timer tasks.
#[derive(Debug)]
pub(crate) struct Session {
    pub(crate) id: SessionId,
    pub(crate) problem: ProblemStatement,
    pub(crate) created_at_ms: u64,
    pub(crate) budget: SessionBudget,
    pub(crate) store: Arc<NodeStore>,
    pub(crate) frontier: Frontier,
    /// Commits take it shared; snapshot capture and abort take it exclusive.
    pub(crate) barrier: RwLock<()>,
    /// Serializes snapshots.
    pub(crate) snapshot_lock: tokio::sync::Mutex<()>,
    state: watch::Sender<SessionState>,
    clock: Mutex<SessionClock>,
    finishing: AtomicBool,
    next_checkpoint_seq: AtomicU64,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        id: SessionId,
        problem: ProblemStatement,
        created_at_ms: u64,
        budget: SessionBudget,
        store: Arc<NodeStore>,
        frontier: Frontier,
        elapsed: Duration,
        next_checkpoint_seq: u64,
    ) -> Self {
        Self {
            id,
            problem,
            created_at_ms,
            budget,
            store,
            frontier,
            barrier: RwLock::new(()),
            snapshot_lock: tokio::sync::Mutex::new(()),
            state: watch::channel(SessionState::Created).0,
            clock: Mutex::new(SessionClock {
                accumulated: elapsed,
                running_since: None,
            }),
            finishing: AtomicBool::new(false),
            next_checkpoint_seq: AtomicU64::new(next_checkpoint_seq),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Move to `to` if the current state is one of `from`.
    ///
    /// Returns the previous state on success and the current one on failure.
    /// The active-time clock follows the state: it runs only while `running`.
    pub(crate) fn transition(
        &self,
        from: &[SessionState],
        to: SessionState,
    ) -> Result<SessionState, SessionState> {
        let mut previous = self.state();
        let changed = self.state.send_if_modified(|state| {
            previous = *state;
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        });
        if !changed {
            return Err(previous);
        }
        let mut clock = self.clock.lock();
        if to == SessionState::Running {
            clock.start();
        } else {
            clock.stop();
        }
        Ok(previous)
    }

    /// Claim the right to finish the session. Only the first caller wins.
    pub(crate) fn begin_finish(&self) -> bool {
        !self.finishing.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn is_finishing(&self) -> bool {
        self.finishing.load(Ordering::Acquire)
    }

    pub(crate) fn elapsed(&self) -> Duration {
        self.clock.lock().elapsed()
    }

    pub(crate) fn take_checkpoint_seq(&self) -> u64 {
        self.next_checkpoint_seq.fetch_add(1, Ordering::AcqRel)
    }

    pub(crate) fn budget_view(&self) -> BudgetView {
        BudgetView {
            nodes_consumed: self.frontier.nodes_consumed(),
            max_nodes: self.budget.max_nodes,
            elapsed: self.elapsed(),
            max_wall_clock: self.budget.max_wall_clock(),
        }
    }

    pub(crate) fn best_patch(&self) -> BestPatch {
        match self.store.best_success() {
            Some(node) => BestPatch::Found {
                node: node.id,
                score: node.score.unwrap_or(f64::NEG_INFINITY),
                patch: node.patch,
            },
            None => BestPatch::NoneFound,
        }
    }

    pub(crate) fn status(&self) -> SessionStatus {
        SessionStatus {
            session: self.id,
            state: self.state(),
            nodes_explored: self.frontier.nodes_consumed(),
            frontier_size: self.frontier.len(),
            leased: self.frontier.leased_count(),
            nodes_total: self.store.len(),
            best_score: self.store.best_success().and_then(|n| n.score),
            elapsed: self.elapsed(),
        }
    }

    pub(crate) fn summary(&self) -> SessionSummary {
        SessionSummary {
            session: self.id,
            state: self.state(),
            problem_reference: self.problem.reference.clone(),
            created_at_ms: self.created_at_ms,
            nodes_explored: self.frontier.nodes_consumed(),
            best_score: self.store.best_success().and_then(|n| n.score),
        }
    }
}
