//! Best-first frontier with leases.
//!
//! Pending nodes wait in a `BinaryHeap` ordered by priority descending, ties
//! broken by creation sequence ascending. Entries are removed lazily: `live`
//! maps each queued node to the generation of its current heap entry, and a
//! popped entry whose generation does not match is skipped.
//!
//! A claim moves the node to `scoring` in the [`NodeStore`] and records a
//! [`Lease`]. Leases end by `release` (the worker is done, whatever it did or
//! did not commit) or by the reaper after the deadline. Either way an
//! uncommitted node is re-queued with its original priority and one more
//! retry, or becomes `terminal-failure` at the retry limit.
//!
//! Lock order: frontier, then store.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use ordered_float::OrderedFloat;
use parking_lot::Mutex;
use patchtree_kernel::carrier::patch::Patch;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::node::{Claim, ClaimToken, NodeId, NodeStatus, Terminality, WorkerId};
use crate::pruner::PruneReason;
use crate::store::{NodeStore, StoreSnapshot};

/// A node handed to a worker.
#[derive(Debug, Clone)]
pub struct ClaimedNode {
    pub node: NodeId,
    pub patch: Patch,
    pub depth: u32,
    /// Frontier priority the node was queued with.
    pub priority: f64,
    /// Score recorded before the claim. `None` for the root and any node
    /// created unscored; the worker evaluates those first.
    pub score: Option<f64>,
    pub terminal: Terminality,
    pub token: ClaimToken,
    pub deadline: Instant,
    pub retries: u32,
}

/// Result of a claim attempt. Everything but `Claimed` means "no work now".
#[derive(Debug, Clone)]
pub enum ClaimResult {
    Claimed(ClaimedNode),
    /// Nothing queued.
    Empty,
    /// Claims are suspended (user pause or snapshot quiesce).
    Paused,
    /// The node budget has been consumed.
    Exhausted,
    /// The session is over; no claim will ever succeed again.
    Closed,
}

/// An active lease.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lease {
    pub worker: WorkerId,
    pub token: ClaimToken,
    pub deadline: Instant,
    /// Priority to re-queue with if the lease is abandoned.
    pub priority: f64,
    pub seq: u64,
}

/// What happened to the node when its lease ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The worker had already committed an outcome (or the node was pruned).
    Resolved,
    /// Uncommitted; queued again with one more retry.
    Requeued { retries: u32 },
    /// Uncommitted and out of retries; now `terminal-failure`.
    RetryLimitReached,
}

/// A lease ended by the reaper.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reaped {
    pub node: NodeId,
    pub worker: WorkerId,
    pub outcome: ReleaseOutcome,
}

/// One persisted frontier entry.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrontierRecord {
    pub node: NodeId,
    pub priority: f64,
    pub seq: u64,
    /// Already counted against the node budget (claimed at least once).
    pub counted: bool,
    /// Captured mid-flight: the node was leased when the snapshot was taken.
    pub leased: bool,
}

/// Frontier entries and store contents captured under one lock.
#[derive(Debug, Clone)]
pub struct FrontierCapture {
    /// Queued entries in pop order, then leased entries by creation sequence.
    pub entries: Vec<FrontierRecord>,
    pub store: StoreSnapshot,
    pub nodes_consumed: u64,
}

#[derive(Debug, Clone, Copy)]
struct FrontierEntry {
    node: NodeId,
    priority: OrderedFloat<f64>,
    seq: u64,
    generation: u64,
    counted: bool,
}

impl PartialEq for FrontierEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for FrontierEntry {}

impl PartialOrd for FrontierEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for FrontierEntry {
    /// Max-heap order: higher priority first, then lower sequence.
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.seq.cmp(&self.seq))
            .then_with(|| other.generation.cmp(&self.generation))
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct Gate {
    user_paused: bool,
    quiesce: u32,
    exhausted: bool,
    closed: bool,
}

#[derive(Debug, Default)]
struct Inner {
    heap: BinaryHeap<FrontierEntry>,
    live: HashMap<NodeId, u64>,
    leases: HashMap<NodeId, Lease>,
    next_generation: u64,
    next_token: u64,
    consumed: u64,
    claim_limit: Option<u64>,
    gate: Gate,
}

impl Inner {
    fn insert(&mut self, node: NodeId, priority: f64, seq: u64, counted: bool) {
        let generation = self.next_generation;
        self.next_generation += 1;
        self.live.insert(node, generation);
        self.heap.push(FrontierEntry {
            node,
            priority: OrderedFloat(priority),
            seq,
            generation,
            counted,
        });
        // Compact once stale entries dominate.
        if self.heap.len() > 64 && self.heap.len() > 2 * self.live.len() {
            let live = &self.live;
            self.heap.retain(|e| live.get(&e.node) == Some(&e.generation));
        }
    }

    fn queued_in_pop_order(&self) -> Vec<FrontierEntry> {
        let mut entries: Vec<FrontierEntry> = self
            .heap
            .iter()
            .filter(|e| self.live.get(&e.node) == Some(&e.generation))
            .copied()
            .collect();
        entries.sort_by(|a, b| b.cmp(a));
        entries
    }

    fn check_budget(&mut self) {
        if let Some(limit) = self.claim_limit {
            if self.consumed >= limit {
                self.gate.exhausted = true;
            }
        }
    }
}

/// Concurrency-safe priority queue of pending nodes.
#[derive(Debug)]
pub struct Frontier {
    store: Arc<NodeStore>,
    retry_limit: u32,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Frontier {
    /// Empty frontier. `claim_limit` caps first-time claims (the node budget).
    #[must_use]
    pub fn new(store: Arc<NodeStore>, retry_limit: u32, claim_limit: Option<u64>) -> Self {
        Self {
            store,
            retry_limit,
            inner: Mutex::new(Inner {
                claim_limit,
                ..Inner::default()
            }),
            notify: Notify::new(),
        }
    }

    /// Rebuild from persisted entries.
    ///
    /// Entries captured mid-flight are queued like any other; their nodes are
    /// expected to have been restored to `pending` already.
    #[must_use]
    pub fn restore(
        store: Arc<NodeStore>,
        retry_limit: u32,
        claim_limit: Option<u64>,
        records: &[FrontierRecord],
        nodes_consumed: u64,
    ) -> Self {
        let frontier = Self::new(store, retry_limit, claim_limit);
        {
            let mut inner = frontier.inner.lock();
            for record in records {
                inner.insert(record.node, record.priority, record.seq, record.counted);
            }
            inner.consumed = nodes_consumed;
            inner.check_budget();
        }
        frontier
    }

    #[must_use]
    pub fn store(&self) -> &Arc<NodeStore> {
        &self.store
    }

    /// Queue a `pending` node with the given priority.
    ///
    /// Returns `false` (and queues nothing) if the frontier is closed, the
    /// node is already queued or leased, or the node is not `pending`.
    pub fn push(&self, node: NodeId, priority: f64) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.gate.closed || inner.live.contains_key(&node) || inner.leases.contains_key(&node)
            {
                return false;
            }
            let seq = match self.store.get_node(node) {
                Ok(n) if n.status == NodeStatus::Pending => n.seq,
                _ => return false,
            };
            inner.insert(node, priority, seq, false);
        }
        self.notify.notify_waiters();
        true
    }

    /// Pop the best entry and lease it to `worker` without waiting.
    pub fn try_claim(&self, worker: WorkerId, lease: Duration) -> ClaimResult {
        let mut inner = self.inner.lock();
        let gate = inner.gate;
        if gate.closed {
            return ClaimResult::Closed;
        }
        if gate.exhausted {
            return ClaimResult::Exhausted;
        }
        if gate.user_paused || gate.quiesce > 0 {
            return ClaimResult::Paused;
        }

        while let Some(entry) = inner.heap.pop() {
            if inner.live.get(&entry.node) != Some(&entry.generation) {
                continue;
            }
            inner.live.remove(&entry.node);

            let token = ClaimToken(inner.next_token);
            inner.next_token += 1;
            let deadline = Instant::now() + lease;
            let claim = Claim {
                worker,
                token,
                deadline,
            };
            let node = match self.store.claim(entry.node, claim) {
                Ok(node) => node,
                Err(err) => {
                    tracing::debug!(node = %entry.node, %err, "dropping stale frontier entry");
                    continue;
                }
            };

            if !entry.counted {
                inner.consumed += 1;
                inner.check_budget();
            }
            inner.leases.insert(
                entry.node,
                Lease {
                    worker,
                    token,
                    deadline,
                    priority: entry.priority.0,
                    seq: entry.seq,
                },
            );
            return ClaimResult::Claimed(ClaimedNode {
                node: entry.node,
                patch: node.patch,
                depth: node.depth,
                priority: entry.priority.0,
                score: node.score,
                terminal: node.terminal,
                token,
                deadline,
                retries: node.retries,
            });
        }
        ClaimResult::Empty
    }

    /// Claim, waiting up to `wait` for work to appear.
    ///
    /// Returns early only with a claim or [`ClaimResult::Closed`]; otherwise
    /// the last non-claim result once `wait` has elapsed.
    pub async fn claim(&self, worker: WorkerId, lease: Duration, wait: Duration) -> ClaimResult {
        let deadline = Instant::now() + wait;
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_claim(worker, lease) {
                result @ (ClaimResult::Claimed(_) | ClaimResult::Closed) => return result,
                other => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return other;
                    }
                }
            }
        }
    }

    /// End `worker`'s lease on `node`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotLeased`] if `worker` holds no lease on `node`.
    pub fn release(&self, worker: WorkerId, node: NodeId) -> Result<ReleaseOutcome, StoreError> {
        let outcome = {
            let mut inner = self.inner.lock();
            let lease = match inner.leases.get(&node) {
                Some(lease) if lease.worker == worker => *lease,
                _ => return Err(StoreError::NotLeased { node, worker }),
            };
            inner.leases.remove(&node);
            self.settle(&mut inner, node, lease)
        };
        if matches!(outcome, ReleaseOutcome::Requeued { .. }) {
            self.notify.notify_waiters();
        }
        Ok(outcome)
    }

    /// Extend `worker`'s lease on `node` by `lease` from now.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotLeased`] if `worker` holds no lease on `node`, or
    /// [`StoreError::LeaseLost`] if the node is no longer held in the store.
    pub fn renew_lease(
        &self,
        worker: WorkerId,
        node: NodeId,
        lease: Duration,
    ) -> Result<Instant, StoreError> {
        let mut inner = self.inner.lock();
        let current = match inner.leases.get_mut(&node) {
            Some(current) if current.worker == worker => current,
            _ => return Err(StoreError::NotLeased { node, worker }),
        };
        let deadline = Instant::now() + lease;
        self.store.renew(node, current.token, deadline)?;
        current.deadline = deadline;
        Ok(deadline)
    }

    /// End every lease whose deadline is at or before `now`.
    pub fn reap_expired(&self, now: Instant) -> Vec<Reaped> {
        let reaped = {
            let mut inner = self.inner.lock();
            let mut expired: Vec<(NodeId, Lease)> = inner
                .leases
                .iter()
                .filter(|(_, lease)| lease.deadline <= now)
                .map(|(node, lease)| (*node, *lease))
                .collect();
            expired.sort_by_key(|(_, lease)| lease.seq);

            let mut reaped = Vec::with_capacity(expired.len());
            for (node, lease) in expired {
                inner.leases.remove(&node);
                let outcome = self.settle(&mut inner, node, lease);
                reaped.push(Reaped {
                    node,
                    worker: lease.worker,
                    outcome,
                });
            }
            reaped
        };
        if reaped
            .iter()
            .any(|r| matches!(r.outcome, ReleaseOutcome::Requeued { .. }))
        {
            self.notify.notify_waiters();
        }
        reaped
    }

    /// Drop any queued entry or lease for `node` without touching the store.
    pub fn remove(&self, node: NodeId) -> bool {
        let mut inner = self.inner.lock();
        let queued = inner.live.remove(&node).is_some();
        let leased = inner.leases.remove(&node).is_some();
        queued || leased
    }

    /// Prune `node` and its open descendants, dropping their entries and leases.
    ///
    /// # Errors
    ///
    /// Propagates [`NodeStore::prune_cascade`] errors.
    pub fn prune_subtree(
        &self,
        node: NodeId,
        reason: PruneReason,
    ) -> Result<Vec<NodeId>, StoreError> {
        let mut inner = self.inner.lock();
        let pruned = self.store.prune_cascade(node, reason)?;
        for id in &pruned {
            inner.live.remove(id);
            inner.leases.remove(id);
        }
        Ok(pruned)
    }

    /// Prune every queued node (in pop order) and empty the queue.
    pub fn prune_queued(&self, reason: PruneReason) -> Vec<NodeId> {
        let mut inner = self.inner.lock();
        let queued = inner.queued_in_pop_order();
        inner.heap.clear();
        inner.live.clear();
        let mut pruned = Vec::with_capacity(queued.len());
        for entry in queued {
            match self.store.prune_cascade(entry.node, reason) {
                Ok(ids) => pruned.extend(ids),
                Err(err) => {
                    tracing::debug!(node = %entry.node, %err, "queued node already final");
                }
            }
        }
        pruned
    }

    /// Remove and return every lease. The store is not touched.
    pub fn revoke_all(&self) -> Vec<(NodeId, Lease)> {
        let mut inner = self.inner.lock();
        let mut revoked: Vec<_> = inner.leases.drain().collect();
        revoked.sort_by_key(|(_, lease)| lease.seq);
        revoked
    }

    /// Operator pause: stop issuing claims until [`Frontier::resume_claims`].
    pub fn pause_claims(&self) {
        self.inner.lock().gate.user_paused = true;
    }

    pub fn resume_claims(&self) {
        self.inner.lock().gate.user_paused = false;
        self.notify.notify_waiters();
    }

    /// Snapshot quiesce. Nests; claims resume when every quiesce has ended.
    pub fn begin_quiesce(&self) {
        self.inner.lock().gate.quiesce += 1;
    }

    pub fn end_quiesce(&self) {
        {
            let mut inner = self.inner.lock();
            inner.gate.quiesce = inner.gate.quiesce.saturating_sub(1);
        }
        self.notify.notify_waiters();
    }

    /// Stop issuing claims because the budget is spent. Queued entries stay.
    pub fn exhaust(&self) {
        self.inner.lock().gate.exhausted = true;
    }

    /// Permanently stop claims and pushes.
    pub fn close(&self) {
        self.inner.lock().gate.closed = true;
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.lock().gate.closed
    }

    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        self.inner.lock().gate.exhausted
    }

    /// Queued (not leased) entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().live.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn leased_count(&self) -> usize {
        self.inner.lock().leases.len()
    }

    /// Nothing queued and nothing leased.
    #[must_use]
    pub fn is_drained(&self) -> bool {
        let inner = self.inner.lock();
        inner.live.is_empty() && inner.leases.is_empty()
    }

    /// Distinct nodes claimed so far.
    #[must_use]
    pub fn nodes_consumed(&self) -> u64 {
        self.inner.lock().consumed
    }

    #[must_use]
    pub fn lease(&self, node: NodeId) -> Option<Lease> {
        self.inner.lock().leases.get(&node).copied()
    }

    /// Queued node ids in the order claims would return them.
    #[must_use]
    pub fn pop_order(&self) -> Vec<NodeId> {
        self.inner
            .lock()
            .queued_in_pop_order()
            .into_iter()
            .map(|e| e.node)
            .collect()
    }

    /// Capture entries, leases and the store in one critical section.
    #[must_use]
    pub fn capture(&self) -> FrontierCapture {
        let inner = self.inner.lock();
        let mut entries: Vec<FrontierRecord> = inner
            .queued_in_pop_order()
            .into_iter()
            .map(|e| FrontierRecord {
                node: e.node,
                priority: e.priority.0,
                seq: e.seq,
                counted: e.counted,
                leased: false,
            })
            .collect();
        let mut leased: Vec<FrontierRecord> = inner
            .leases
            .iter()
            .map(|(node, lease)| FrontierRecord {
                node: *node,
                priority: lease.priority,
                seq: lease.seq,
                counted: true,
                leased: true,
            })
            .collect();
        leased.sort_by_key(|r| r.seq);
        entries.extend(leased);

        FrontierCapture {
            entries,
            store: self.store.snapshot(),
            nodes_consumed: inner.consumed,
        }
    }

    fn settle(&self, inner: &mut Inner, node: NodeId, lease: Lease) -> ReleaseOutcome {
        match self.store.reclaim(node, lease.token, self.retry_limit) {
            Ok(NodeStatus::Pending) => {
                inner.insert(node, lease.priority, lease.seq, true);
                let retries = self.store.get_node(node).map_or(0, |n| n.retries);
                ReleaseOutcome::Requeued { retries }
            }
            Ok(_) => ReleaseOutcome::RetryLimitReached,
            Err(_) => ReleaseOutcome::Resolved,
        }
    }
}
