//! Session coordinator: lifecycle, worker pool, reaper, and checkpoints.
//!
//! Each running session owns `max_concurrency` worker tasks, one lease
//! reaper and one checkpoint timer, all spawned on the caller's Tokio
//! runtime.
//!
//! A claim is an expansion. Children are evaluated, scored and classified
//! by the worker that generated them, so they enter the frontier with their
//! own score, and a child that is terminal or pruned on arrival never costs
//! a claim. Only a node claimed without a score (the root) is evaluated
//! under its own claim. While holding the lease a worker calls the
//! generator and the evaluator, then commits in one step under the session
//! barrier:
//!
//! ```text
//! set_score -> resolve(next) -> create scored children -> push pending ones -> release
//! ```
//!
//! Snapshots take the barrier exclusively, so a checkpoint never observes a
//! half-applied commit. A worker that fails (collaborator error on the node
//! or any of its children, lost lease) commits nothing; releasing its lease
//! re-queues the node with one more retry.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use patchtree_kernel::carrier::patch::Patch;
use tokio::runtime::Handle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::checkpoint::{CheckpointHeader, CheckpointId, CheckpointImage, CHECKPOINT_FORMAT};
use crate::checkpoint_reader::read_checkpoint;
use crate::checkpoint_store::CheckpointStore;
use crate::checkpoint_writer::encode_checkpoint;
use crate::config::{EngineConfig, SessionBudget};
use crate::contract::{PatchEvaluator, PatchGenerator, ProblemStatement};
use crate::error::{EngineError, ExternalError, StoreError};
use crate::frontier::{ClaimResult, ClaimedNode, Frontier, FrontierRecord, ReleaseOutcome};
use crate::node::{NodeId, NodeStatus, SearchNode, Terminality, WorkerId};
use crate::pruner::{PruneCandidate, PruneReason, Pruner};
use crate::scorer::{ScoreAdapter, ScoreOutcome};
use crate::session::{BestPatch, Session, SessionId, SessionState, SessionStatus, SessionSummary};
use crate::store::{ChildScore, CreateOutcome, NodeStore, StoreSnapshot};

/// How often a snapshot re-checks for in-flight leases while quiescing.
const QUIESCE_POLL: Duration = Duration::from_millis(5);

/// The external services a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub generator: Arc<dyn PatchGenerator>,
    pub evaluator: Arc<dyn PatchEvaluator>,
    pub scorer: Arc<dyn ScoreAdapter>,
    pub checkpoints: Arc<dyn CheckpointStore>,
}

struct Shared {
    config: EngineConfig,
    pruner: Pruner,
    collab: Collaborators,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

/// Control surface over all sessions of one engine instance.
///
/// Cheap to clone; clones share sessions.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

/// Outcome of one claimed node, decided before anything is committed.
enum Verdict {
    Terminal(NodeStatus),
    Prune(PruneReason),
    Expand(Vec<Proposal>),
}

/// A generated child. `scored` is `None` when its content was already known,
/// in which case it only becomes an alias.
struct Proposal {
    patch: Patch,
    scored: Option<ChildScore>,
}

struct Scored {
    score: f64,
    terminal: Terminality,
    verdict: Verdict,
}

#[derive(Debug, Default)]
struct CommitSummary {
    created: usize,
    queued: usize,
    duplicates: usize,
}

impl Coordinator {
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] if `config` fails validation.
    pub fn new(config: EngineConfig, collab: Collaborators) -> Result<Self, EngineError> {
        config.validate()?;
        Ok(Self {
            shared: Arc::new(Shared {
                pruner: Pruner::new(config.pruner.clone()),
                config,
                collab,
                sessions: RwLock::new(HashMap::new()),
            }),
        })
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start exploring `problem` and return the new session's id.
    ///
    /// Must be called from within a Tokio runtime; the session's tasks are
    /// spawned on it.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidConfig`] for a nonsensical budget and
    /// [`EngineError::NoRuntime`] outside a runtime.
    pub fn start(
        &self,
        problem: ProblemStatement,
        budget: SessionBudget,
    ) -> Result<SessionId, EngineError> {
        budget.validate()?;
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;

        let id = SessionId::new();
        let store = Arc::new(NodeStore::new());
        let root = store.create_root(problem.root_patch.clone())?;
        let frontier = Frontier::new(
            Arc::clone(&store),
            self.shared.config.lease.retry_limit,
            Some(budget.max_nodes),
        );
        frontier.push(root, 0.0);

        let session = Arc::new(Session::new(
            id,
            problem,
            unix_millis(),
            budget,
            store,
            frontier,
            Duration::ZERO,
            1,
        ));
        tracing::info!(
            session = %id,
            problem = %session.problem.reference,
            max_nodes = budget.max_nodes,
            max_concurrency = budget.max_concurrency,
            "session started"
        );
        self.launch(&runtime, session)?;
        Ok(id)
    }

    /// # Errors
    ///
    /// [`EngineError::UnknownSession`].
    pub fn status(&self, id: SessionId) -> Result<SessionStatus, EngineError> {
        Ok(self.session(id)?.status())
    }

    /// Highest-scored `terminal-success` node, or [`BestPatch::NoneFound`].
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSession`] only.
    pub fn best_patch(&self, id: SessionId) -> Result<BestPatch, EngineError> {
        Ok(self.session(id)?.best_patch())
    }

    /// Lineage of the best patch, root first. Empty when nothing has succeeded yet.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSession`].
    pub fn best_path(&self, id: SessionId) -> Result<Vec<NodeId>, EngineError> {
        let session = self.session(id)?;
        let Some(best) = session.store.best_success() else {
            return Ok(Vec::new());
        };
        let mut path = session.store.path_to_root(best.id)?;
        path.reverse();
        Ok(path)
    }

    /// Point-in-time copy of one node.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSession`] or [`StoreError::NotFound`].
    pub fn node(&self, id: SessionId, node: NodeId) -> Result<SearchNode, EngineError> {
        Ok(self.session(id)?.store.get_node(node)?)
    }

    /// Operator prune of `node` and its open descendants.
    ///
    /// Returns the ids that changed status.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionTerminal`] once the session is over, and store
    /// errors for an unknown or already-final node.
    pub fn prune(&self, id: SessionId, node: NodeId) -> Result<Vec<NodeId>, EngineError> {
        let session = self.session(id)?;
        ensure_not_terminal(&session)?;
        let pruned = {
            let _commit = session.barrier.read();
            session.frontier.prune_subtree(node, PruneReason::Manual)?
        };
        tracing::info!(session = %id, %node, count = pruned.len(), "manual prune");
        Ok(pruned)
    }

    /// Stop issuing claims. Leases already out finish normally.
    ///
    /// # Errors
    ///
    /// [`EngineError::InvalidState`] unless the session is running.
    pub fn pause(&self, id: SessionId) -> Result<(), EngineError> {
        let session = self.session(id)?;
        ensure_not_terminal(&session)?;
        session.frontier.pause_claims();
        if let Err(state) = session.transition(&[SessionState::Running], SessionState::Paused) {
            if state != SessionState::Paused {
                session.frontier.resume_claims();
            }
            return Err(EngineError::InvalidState {
                session: id,
                state,
                op: "pause",
            });
        }
        tracing::info!(session = %id, "session paused");
        Ok(())
    }

    /// # Errors
    ///
    /// [`EngineError::InvalidState`] unless the session is paused.
    pub fn resume(&self, id: SessionId) -> Result<(), EngineError> {
        let session = self.session(id)?;
        ensure_not_terminal(&session)?;
        session
            .transition(&[SessionState::Paused], SessionState::Running)
            .map_err(|state| EngineError::InvalidState {
                session: id,
                state,
                op: "resume",
            })?;
        session.frontier.resume_claims();
        tracing::info!(session = %id, "session resumed");
        Ok(())
    }

    /// Stop the session: capture a final checkpoint, revoke every lease,
    /// expire open nodes, and persist.
    ///
    /// Leases are invalidated before anything is awaited. A periodic
    /// snapshot still in progress gives up rather than delaying the abort.
    ///
    /// Returns `aborted`, or `failed` if the final checkpoint could not be
    /// made durable.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionTerminal`] for a finished session and
    /// [`EngineError::InvalidState`] if it is already finishing.
    pub async fn abort(&self, id: SessionId) -> Result<SessionState, EngineError> {
        let session = self.session(id)?;
        ensure_not_terminal(&session)?;
        if !session.begin_finish() {
            return Err(EngineError::InvalidState {
                session: id,
                state: session.state(),
                op: "abort",
            });
        }

        let image = {
            let _exclusive = session.barrier.write();
            let image = capture_image(&session, SessionState::Aborted);
            session.frontier.close();
            let revoked = session.frontier.revoke_all();
            let expired = session.store.expire_open();
            tracing::info!(
                session = %id,
                revoked = revoked.len(),
                expired = expired.len(),
                "session aborting"
            );
            image
        };

        let outcome = match persist_image(&self.shared, &session, &image).await {
            Ok(_) => SessionState::Aborted,
            Err(err) => {
                tracing::error!(session = %id, %err, "final checkpoint failed during abort");
                SessionState::Failed
            }
        };
        let _ = session.transition(
            &[
                SessionState::Created,
                SessionState::Running,
                SessionState::Paused,
            ],
            outcome,
        );
        tracing::info!(session = %id, state = %outcome, "session stopped");
        Ok(outcome)
    }

    /// Summaries of every session this coordinator knows about.
    #[must_use]
    pub fn list(&self) -> Vec<SessionSummary> {
        let mut rows: Vec<SessionSummary> = self
            .shared
            .sessions
            .read()
            .values()
            .map(|session| session.summary())
            .collect();
        rows.sort_by_key(|row| (row.created_at_ms, row.session));
        rows
    }

    /// Forget a finished session. Its checkpoints stay in the store.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionActive`] unless the session is in a terminal state.
    pub fn delete(&self, id: SessionId) -> Result<(), EngineError> {
        let mut sessions = self.shared.sessions.write();
        let session = sessions.get(&id).ok_or(EngineError::UnknownSession(id))?;
        if !session.state().is_terminal() {
            return Err(EngineError::SessionActive(id));
        }
        sessions.remove(&id);
        tracing::debug!(session = %id, "session deleted");
        Ok(())
    }

    /// Take and persist a checkpoint now.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionTerminal`] for a finished session, otherwise
    /// encoding or store errors after the configured write attempts.
    pub async fn snapshot(&self, id: SessionId) -> Result<CheckpointId, EngineError> {
        let session = self.session(id)?;
        ensure_not_terminal(&session)?;
        let state = session.state();
        take_snapshot(&self.shared, &session, state).await
    }

    /// Rehydrate the session from checkpoint `id`, falling back to older
    /// checkpoints of the same session if it is corrupt, and resume it.
    ///
    /// # Errors
    ///
    /// [`EngineError::SessionActive`] if the session is live in this
    /// coordinator, [`EngineError::NoValidCheckpoint`] if nothing at or
    /// below `id.seq` validates.
    pub async fn restore(&self, id: CheckpointId) -> Result<SessionStatus, EngineError> {
        self.ensure_not_active(id.session)?;
        let listed = self.shared.collab.checkpoints.list(id.session).await?;
        let next_seq = listed.iter().copied().max().unwrap_or(0).max(id.seq) + 1;
        let candidates: Vec<u64> = listed
            .into_iter()
            .filter(|seq| *seq <= id.seq)
            .rev()
            .collect();
        self.restore_from(id.session, &candidates, next_seq).await
    }

    /// Resume `session` from its newest valid checkpoint.
    ///
    /// # Errors
    ///
    /// As [`Coordinator::restore`].
    pub async fn resume_from_store(&self, session: SessionId) -> Result<SessionStatus, EngineError> {
        self.ensure_not_active(session)?;
        let listed = self.shared.collab.checkpoints.list(session).await?;
        let next_seq = listed.iter().max().map_or(1, |max| max + 1);
        let candidates: Vec<u64> = listed.into_iter().rev().collect();
        self.restore_from(session, &candidates, next_seq).await
    }

    /// Wait until the session reaches a terminal state or `timeout` elapses.
    ///
    /// Returns the state at that point, terminal or not.
    ///
    /// # Errors
    ///
    /// [`EngineError::UnknownSession`].
    pub async fn wait(&self, id: SessionId, timeout: Duration) -> Result<SessionState, EngineError> {
        let session = self.session(id)?;
        let mut states = session.subscribe();
        let reached = tokio::time::timeout(timeout, async {
            states.wait_for(|state| state.is_terminal()).await.map(|s| *s)
        })
        .await;
        Ok(match reached {
            Ok(Ok(state)) => state,
            _ => session.state(),
        })
    }

    fn session(&self, id: SessionId) -> Result<Arc<Session>, EngineError> {
        self.shared
            .sessions
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::UnknownSession(id))
    }

    fn ensure_not_active(&self, id: SessionId) -> Result<(), EngineError> {
        match self.shared.sessions.read().get(&id) {
            Some(session) if !session.state().is_terminal() => Err(EngineError::SessionActive(id)),
            _ => Ok(()),
        }
    }

    async fn restore_from(
        &self,
        session_id: SessionId,
        candidates: &[u64],
        next_seq: u64,
    ) -> Result<SessionStatus, EngineError> {
        let runtime = Handle::try_current().map_err(|_| EngineError::NoRuntime)?;
        let mut skipped = Vec::new();

        for &seq in candidates {
            let id = CheckpointId {
                session: session_id,
                seq,
            };
            let bytes = match self.shared.collab.checkpoints.get(id).await {
                Ok(bytes) => bytes,
                Err(err) => {
                    tracing::warn!(checkpoint = %id, %err, "checkpoint unreadable");
                    skipped.push(seq);
                    continue;
                }
            };
            let image = match read_checkpoint(id, &bytes) {
                Ok(image) => image,
                Err(err) => {
                    tracing::warn!(checkpoint = %id, %err, "checkpoint corrupt; trying an older one");
                    skipped.push(seq);
                    continue;
                }
            };

            if !skipped.is_empty() {
                tracing::warn!(
                    session = %session_id,
                    restored = seq,
                    skipped = ?skipped,
                    "restored an older checkpoint; progress after it is lost"
                );
            }
            let recorded = image.header.state;
            let session = Arc::new(rehydrate(&self.shared.config, image, next_seq)?);
            if recorded.is_terminal() {
                self.register_finished(Arc::clone(&session), recorded)?;
            } else {
                self.launch(&runtime, Arc::clone(&session))?;
            }
            tracing::info!(
                session = %session_id,
                checkpoint = seq,
                state = %session.state(),
                nodes = session.store.len(),
                queued = session.frontier.len(),
                "session restored"
            );
            return Ok(session.status());
        }
        Err(EngineError::NoValidCheckpoint(session_id))
    }

    fn register(&self, session: &Arc<Session>) -> Result<(), EngineError> {
        let mut sessions = self.shared.sessions.write();
        if let Some(existing) = sessions.get(&session.id) {
            if !existing.state().is_terminal() {
                return Err(EngineError::SessionActive(session.id));
            }
        }
        sessions.insert(session.id, Arc::clone(session));
        Ok(())
    }

    /// Register a session restored from a checkpoint of a finished session.
    ///
    /// It keeps the recorded terminal state and gets no tasks, so it can be
    /// inspected but never does more work. An aborted session's open nodes
    /// are expired, as they were when it stopped.
    fn register_finished(
        &self,
        session: Arc<Session>,
        state: SessionState,
    ) -> Result<(), EngineError> {
        session.begin_finish();
        session.frontier.close();
        if state == SessionState::Aborted {
            session.store.expire_open();
        }
        session
            .transition(&[SessionState::Created], state)
            .map_err(|current| EngineError::InvalidState {
                session: session.id,
                state: current,
                op: "restore",
            })?;
        self.register(&session)
    }

    /// Register `session` and spawn its tasks.
    fn launch(&self, runtime: &Handle, session: Arc<Session>) -> Result<(), EngineError> {
        self.register(&session)?;
        session
            .transition(&[SessionState::Created], SessionState::Running)
            .map_err(|state| EngineError::InvalidState {
                session: session.id,
                state,
                op: "start",
            })?;

        for n in 0..session.budget.max_concurrency {
            runtime.spawn(run_worker(
                Arc::clone(&self.shared),
                Arc::clone(&session),
                WorkerId(n),
            ));
        }
        runtime.spawn(run_reaper(Arc::clone(&self.shared), Arc::clone(&session)));
        runtime.spawn(run_checkpoint_timer(
            Arc::clone(&self.shared),
            session,
        ));
        Ok(())
    }
}

fn ensure_not_terminal(session: &Session) -> Result<(), EngineError> {
    let state = session.state();
    if state.is_terminal() {
        return Err(EngineError::SessionTerminal {
            session: session.id,
            state,
        });
    }
    Ok(())
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

// ---------------------------------------------------------------------------
// Workers
// ---------------------------------------------------------------------------

async fn run_worker(shared: Arc<Shared>, session: Arc<Session>, worker: WorkerId) {
    let lease = shared.config.lease.lease_duration();
    let wait = shared.config.lease.claim_wait();
    loop {
        match session.frontier.claim(worker, lease, wait).await {
            ClaimResult::Closed => break,
            ClaimResult::Claimed(claimed) => {
                process(&shared, &session, worker, claimed).await;
                maybe_finish(&shared, &session).await;
            }
            ClaimResult::Empty | ClaimResult::Exhausted => maybe_finish(&shared, &session).await,
            ClaimResult::Paused => {}
        }
    }
    tracing::trace!(session = %session.id, %worker, "worker stopped");
}

async fn process(shared: &Shared, session: &Session, worker: WorkerId, claimed: ClaimedNode) {
    let node = claimed.node;
    match explore(shared, session, worker, &claimed).await {
        Ok(Some(scored)) => match commit(session, worker, &claimed, scored) {
            Ok(summary) => tracing::debug!(
                session = %session.id,
                %node,
                created = summary.created,
                queued = summary.queued,
                duplicates = summary.duplicates,
                "node committed"
            ),
            Err(err) => {
                tracing::debug!(session = %session.id, %node, %err, "commit discarded");
            }
        },
        Ok(None) => {
            tracing::debug!(session = %session.id, %node, "lease lost before commit");
            settle(session, worker, node);
        }
        Err(err) => {
            tracing::warn!(
                session = %session.id,
                %node,
                retries = claimed.retries,
                error = %err,
                source = ?std::error::Error::source(&err),
                "unable to expand node"
            );
            settle(session, worker, node);
        }
    }
}

/// Classify a claimed node and, if it is kept, expand it. `Ok(None)` means
/// the lease was lost along the way and nothing may be committed.
async fn explore(
    shared: &Shared,
    session: &Session,
    worker: WorkerId,
    claimed: &ClaimedNode,
) -> Result<Option<Scored>, ExternalError> {
    let outcome = match claimed.score {
        Some(value) => ScoreOutcome {
            value,
            terminal: claimed.terminal,
        },
        None => evaluate(shared, session, &claimed.patch).await?,
    };
    let siblings = session
        .store
        .sibling_scores(claimed.node)
        .unwrap_or_default();

    let verdict = match classify(&shared.pruner, claimed.depth, outcome, &siblings) {
        (NodeStatus::Pruned, reason) => Verdict::Prune(reason.unwrap_or(PruneReason::Manual)),
        (NodeStatus::Pending, _) => {
            // The generator may be slow; keep the lease alive across it.
            if !renew(shared, session, worker, claimed.node) {
                return Ok(None);
            }
            let patches = shared
                .collab
                .generator
                .propose(&session.problem, &claimed.patch)
                .await?;
            match score_children(shared, session, worker, claimed, patches).await? {
                Some(proposals) => Verdict::Expand(proposals),
                None => return Ok(None),
            }
        }
        (status, _) => Verdict::Terminal(status),
    };

    Ok(Some(Scored {
        score: outcome.value,
        terminal: outcome.terminal,
        verdict,
    }))
}

async fn evaluate(
    shared: &Shared,
    session: &Session,
    patch: &Patch,
) -> Result<ScoreOutcome, ExternalError> {
    let signals = shared
        .collab
        .evaluator
        .evaluate(&session.problem, patch)
        .await?;
    let outcome = shared.collab.scorer.score(patch, &signals);
    if !outcome.value.is_finite() {
        return Err(ExternalError::evaluator(anyhow::anyhow!(
            "scorer produced non-finite value {}",
            outcome.value
        )));
    }
    Ok(outcome)
}

/// Where a freshly scored node goes: `pending` (keep and expand),
/// `pruned` with its reason, or a terminal status.
fn classify(
    pruner: &Pruner,
    depth: u32,
    outcome: ScoreOutcome,
    siblings: &[f64],
) -> (NodeStatus, Option<PruneReason>) {
    match outcome.terminal {
        Terminality::Success => (NodeStatus::TerminalSuccess, None),
        Terminality::Failure => (NodeStatus::TerminalFailure, None),
        Terminality::None => {
            let candidate = PruneCandidate {
                depth,
                score: outcome.value,
            };
            match pruner.should_prune(candidate, siblings) {
                Some(reason) => (NodeStatus::Pruned, Some(reason)),
                None => (NodeStatus::Pending, None),
            }
        }
    }
}

fn renew(shared: &Shared, session: &Session, worker: WorkerId, node: NodeId) -> bool {
    session
        .frontier
        .renew_lease(worker, node, shared.config.lease.lease_duration())
        .is_ok()
}

/// Evaluate every new child of `claimed` and classify it against its
/// siblings from the same expansion.
///
/// Content already in the store (or repeated within the batch) is not
/// evaluated again. `Ok(None)` means the lease was lost.
async fn score_children(
    shared: &Shared,
    session: &Session,
    worker: WorkerId,
    claimed: &ClaimedNode,
    patches: Vec<Patch>,
) -> Result<Option<Vec<Proposal>>, ExternalError> {
    let mut seen = HashSet::with_capacity(patches.len());
    let mut evaluated = Vec::with_capacity(patches.len());
    for patch in patches {
        let fresh = seen.insert(NodeId::for_patch(&patch))
            && session.store.lookup(&patch.content_hash()).is_none();
        if !fresh {
            evaluated.push((patch, None));
            continue;
        }
        if !renew(shared, session, worker, claimed.node) {
            return Ok(None);
        }
        let outcome = evaluate(shared, session, &patch).await?;
        evaluated.push((patch, Some(outcome)));
    }

    let scores: Vec<Option<f64>> = evaluated
        .iter()
        .map(|(_, outcome)| outcome.map(|o| o.value))
        .collect();
    let depth = claimed.depth + 1;
    let proposals = evaluated
        .into_iter()
        .enumerate()
        .map(|(i, (patch, outcome))| {
            let scored = outcome.map(|outcome| {
                let siblings: Vec<f64> = scores
                    .iter()
                    .enumerate()
                    .filter(|&(j, _)| j != i)
                    .filter_map(|(_, score)| *score)
                    .collect();
                let (status, prune_reason) =
                    classify(&shared.pruner, depth, outcome, &siblings);
                ChildScore {
                    score: outcome.value,
                    terminal: outcome.terminal,
                    status,
                    prune_reason,
                }
            });
            Proposal { patch, scored }
        })
        .collect();
    Ok(Some(proposals))
}

/// Apply a scored outcome and release the lease, atomically with respect to snapshots.
fn commit(
    session: &Session,
    worker: WorkerId,
    claimed: &ClaimedNode,
    scored: Scored,
) -> Result<CommitSummary, StoreError> {
    let _commit = session.barrier.read();
    let applied = apply(session, claimed, scored);
    release(session, worker, claimed.node);
    applied
}

fn apply(
    session: &Session,
    claimed: &ClaimedNode,
    scored: Scored,
) -> Result<CommitSummary, StoreError> {
    let store = &session.store;
    let node = claimed.node;
    let token = claimed.token;
    store.set_score(node, token, scored.score, scored.terminal)?;

    let mut summary = CommitSummary::default();
    match scored.verdict {
        Verdict::Terminal(status) => {
            store.resolve(node, token, status, None)?;
            if status == NodeStatus::TerminalSuccess {
                tracing::info!(session = %session.id, %node, score = scored.score, "terminal success");
            }
        }
        Verdict::Prune(reason) => {
            store.resolve(node, token, NodeStatus::Pruned, Some(reason))?;
            tracing::debug!(session = %session.id, %node, score = scored.score, %reason, "pruned");
        }
        Verdict::Expand(proposals) => {
            store.resolve(node, token, NodeStatus::Expandable, None)?;
            for Proposal { patch, scored: child_score } in proposals {
                let created = match child_score {
                    Some(child_score) => store.create_scored(node, patch, child_score)?,
                    None => store.create_node(node, patch)?,
                };
                match created {
                    CreateOutcome::Created(child) => {
                        summary.created += 1;
                        // Unscored children are evaluated when claimed.
                        let priority = child_score.map_or(scored.score, |c| c.score);
                        if session.frontier.push(child, priority) {
                            summary.queued += 1;
                        }
                        log_arrival(session, child, child_score);
                    }
                    CreateOutcome::Duplicate(existing) => {
                        summary.duplicates += 1;
                        tracing::trace!(session = %session.id, parent = %node, %existing, "duplicate child");
                    }
                }
            }
        }
    }
    Ok(summary)
}

fn log_arrival(session: &Session, child: NodeId, scored: Option<ChildScore>) {
    let Some(scored) = scored else { return };
    match scored.status {
        NodeStatus::TerminalSuccess => {
            tracing::info!(session = %session.id, node = %child, score = scored.score, "terminal success");
        }
        NodeStatus::Pruned => tracing::debug!(
            session = %session.id,
            node = %child,
            score = scored.score,
            reason = ?scored.prune_reason,
            "pruned on arrival"
        ),
        _ => {}
    }
}

/// Release without committing, under the barrier so the re-queue is atomic
/// with respect to snapshots.
fn settle(session: &Session, worker: WorkerId, node: NodeId) {
    let _commit = session.barrier.read();
    release(session, worker, node);
}

fn release(session: &Session, worker: WorkerId, node: NodeId) {
    match session.frontier.release(worker, node) {
        Ok(ReleaseOutcome::Resolved) => {}
        Ok(ReleaseOutcome::Requeued { retries }) => {
            tracing::info!(session = %session.id, %node, retries, "node re-queued");
        }
        Ok(ReleaseOutcome::RetryLimitReached) => {
            tracing::warn!(session = %session.id, %node, "retry limit reached; node failed");
        }
        // Reaped, pruned, or revoked by abort while the worker was busy.
        Err(err) => tracing::debug!(session = %session.id, %node, %err, "lease already gone"),
    }
}

// ---------------------------------------------------------------------------
// Reaper and checkpoint timer
// ---------------------------------------------------------------------------

async fn run_reaper(shared: Arc<Shared>, session: Arc<Session>) {
    let mut ticker = tokio::time::interval(shared.config.lease.reaper_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if session.frontier.is_closed() {
            break;
        }

        let reaped = {
            let _commit = session.barrier.read();
            session.frontier.reap_expired(Instant::now())
        };
        for r in &reaped {
            match r.outcome {
                ReleaseOutcome::Requeued { retries } => tracing::warn!(
                    session = %session.id,
                    node = %r.node,
                    worker = %r.worker,
                    retries,
                    "lease expired; node re-queued"
                ),
                ReleaseOutcome::RetryLimitReached => tracing::warn!(
                    session = %session.id,
                    node = %r.node,
                    worker = %r.worker,
                    "lease expired at retry limit; node failed"
                ),
                ReleaseOutcome::Resolved => {}
            }
        }

        if session.state() == SessionState::Running
            && !session.frontier.is_exhausted()
            && session.elapsed() >= session.budget.max_wall_clock()
        {
            tracing::info!(session = %session.id, "wall-clock budget exhausted");
            session.frontier.exhaust();
        }
        maybe_finish(&shared, &session).await;
    }
}

async fn run_checkpoint_timer(shared: Arc<Shared>, session: Arc<Session>) {
    let mut ticker = tokio::time::interval(shared.config.checkpoint.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        ticker.tick().await;
        if session.frontier.is_closed() || session.is_finishing() {
            break;
        }
        if session.state() != SessionState::Running {
            continue;
        }
        match take_snapshot(&shared, &session, SessionState::Running).await {
            Ok(_) => {}
            // Finishing writes its own final checkpoint.
            Err(_) if session.is_finishing() => break,
            Err(err) => {
                tracing::error!(session = %session.id, %err, "periodic checkpoint failed");
                fail_session(&session);
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Finishing
// ---------------------------------------------------------------------------

/// Complete the session once nothing is queued or leased, or once the budget
/// is spent and in-flight work has drained.
async fn maybe_finish(shared: &Shared, session: &Session) {
    if session.state() != SessionState::Running {
        return;
    }
    let frontier = &session.frontier;
    let done = frontier.is_drained() || (frontier.is_exhausted() && frontier.leased_count() == 0);
    if !done || !session.begin_finish() {
        return;
    }

    // Only queued nodes are pending here; leased work has already drained.
    if let Some(reason) = Pruner::budget_cutoff(&session.budget_view()) {
        let pruned = {
            let _commit = session.barrier.read();
            frontier.prune_queued(reason)
        };
        if !pruned.is_empty() {
            tracing::info!(session = %session.id, count = pruned.len(), "pruned pending nodes on budget exhaustion");
        }
    }

    let next = match take_snapshot(shared, session, SessionState::Completed).await {
        Ok(_) => SessionState::Completed,
        Err(err) => {
            tracing::error!(session = %session.id, %err, "final checkpoint failed");
            SessionState::Failed
        }
    };
    frontier.close();
    let _ = session.transition(&[SessionState::Running, SessionState::Paused], next);
    let status = session.status();
    tracing::info!(
        session = %session.id,
        state = %next,
        nodes_explored = status.nodes_explored,
        best_score = ?status.best_score,
        "session finished"
    );
    let counts: Vec<(NodeStatus, usize)> = NodeStatus::ALL
        .into_iter()
        .zip(frontier.store().status_counts())
        .filter(|&(_, n)| n > 0)
        .collect();
    tracing::debug!(session = %session.id, ?counts, "final node statuses");
}

fn fail_session(session: &Session) {
    if !session.begin_finish() {
        return;
    }
    session.frontier.close();
    let _ = session.transition(
        &[SessionState::Running, SessionState::Paused],
        SessionState::Failed,
    );
    tracing::error!(session = %session.id, "session failed: checkpoints are not durable");
}

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// Ends a quiesce even if the snapshot future is dropped mid-wait.
struct Quiesce<'a>(&'a Frontier);

impl<'a> Quiesce<'a> {
    fn begin(frontier: &'a Frontier) -> Self {
        frontier.begin_quiesce();
        Self(frontier)
    }
}

impl Drop for Quiesce<'_> {
    fn drop(&mut self) {
        self.0.end_quiesce();
    }
}

/// Quiesce, capture and persist a checkpoint recording `state`.
///
/// A non-terminal snapshot gives up once the session starts finishing, so
/// the finishing path's checkpoint is always the newest one.
async fn take_snapshot(
    shared: &Shared,
    session: &Session,
    state: SessionState,
) -> Result<CheckpointId, EngineError> {
    let superseded = || !state.is_terminal() && session.is_finishing();
    let _serial = session.snapshot_lock.lock().await;
    let image = {
        let _quiesce = Quiesce::begin(&session.frontier);
        let deadline = Instant::now() + shared.config.checkpoint.quiesce_timeout();
        while session.frontier.leased_count() > 0 && Instant::now() < deadline && !superseded() {
            tokio::time::sleep(QUIESCE_POLL).await;
        }
        let _exclusive = session.barrier.write();
        if superseded() {
            return Err(EngineError::InvalidState {
                session: session.id,
                state: session.state(),
                op: "snapshot",
            });
        }
        capture_image(session, state)
    };
    persist_image(shared, session, &image).await
}

fn capture_image(session: &Session, state: SessionState) -> CheckpointImage {
    let capture = session.frontier.capture();
    let seq = session.take_checkpoint_seq();
    CheckpointImage {
        header: CheckpointHeader {
            format: CHECKPOINT_FORMAT.to_owned(),
            session: session.id,
            seq,
            problem_reference: session.problem.reference.clone(),
            problem_description: session.problem.description.clone(),
            problem_digest: session.problem.digest(),
            created_at_ms: session.created_at_ms,
            state,
            budget: session.budget,
            nodes_consumed: capture.nodes_consumed,
            elapsed_ms: u64::try_from(session.elapsed().as_millis()).unwrap_or(u64::MAX),
            node_count: 0,
            frontier_count: 0,
            alias_count: 0,
        },
        nodes: capture.store.nodes,
        frontier: capture.entries,
        aliases: capture.store.aliases,
    }
}

async fn persist_image(
    shared: &Shared,
    session: &Session,
    image: &CheckpointImage,
) -> Result<CheckpointId, EngineError> {
    let id = image.header.id();
    let bytes = encode_checkpoint(image)?;
    let config = &shared.config.checkpoint;
    let store = &shared.collab.checkpoints;

    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        match store.put(id, bytes.clone()).await {
            Ok(()) => break,
            Err(err) if attempt < config.write_attempts => {
                tracing::warn!(checkpoint = %id, attempt, %err, "checkpoint write failed; retrying");
                tokio::time::sleep(config.retry_backoff() * attempt).await;
            }
            Err(err) => {
                tracing::error!(checkpoint = %id, attempts = attempt, %err, "checkpoint write failed");
                return Err(err.into());
            }
        }
    }
    tracing::info!(
        checkpoint = %id,
        bytes = bytes.len(),
        nodes = image.nodes.len(),
        frontier = image.frontier.len(),
        "checkpoint written"
    );

    if let Err(err) = store
        .prune_older_than_retention(session.id, config.retention)
        .await
    {
        tracing::warn!(session = %session.id, %err, "checkpoint retention failed");
    }
    Ok(id)
}

/// Build a fresh session from a validated image.
///
/// Nodes captured mid-flight come back `pending` with their retries and any
/// recorded score unchanged, and stay queued at their captured priority;
/// only the interrupted expansion is redone.
fn rehydrate(
    config: &EngineConfig,
    image: CheckpointImage,
    next_seq: u64,
) -> Result<Session, EngineError> {
    let CheckpointImage {
        header,
        mut nodes,
        frontier,
        aliases,
    } = image;
    let retry_limit = config.lease.retry_limit;

    for node in &mut nodes {
        if node.status == NodeStatus::Scoring {
            node.status = NodeStatus::Pending;
        }
    }
    let records: Vec<FrontierRecord> = frontier
        .into_iter()
        .map(|record| FrontierRecord {
            leased: false,
            ..record
        })
        .collect();

    let store = Arc::new(NodeStore::from_snapshot(StoreSnapshot { nodes, aliases }));
    let root = store
        .root()
        .map(|root| store.get_node(root))
        .transpose()?
        .map(|root| root.patch);
    let mut problem = ProblemStatement::new(header.problem_reference, header.problem_description);
    if let Some(root_patch) = root {
        problem = problem.with_root_patch(root_patch);
    }
    if problem.digest() != header.problem_digest {
        tracing::warn!(session = %header.session, "problem digest differs from checkpoint header");
    }

    let frontier = Frontier::restore(
        Arc::clone(&store),
        retry_limit,
        Some(header.budget.max_nodes),
        &records,
        header.nodes_consumed,
    );
    Ok(Session::new(
        header.session,
        problem,
        header.created_at_ms,
        header.budget,
        store,
        frontier,
        Duration::from_millis(header.elapsed_ms),
        next_seq,
    ))
}
