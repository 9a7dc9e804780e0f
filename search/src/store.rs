//! Node store: the arena of search nodes and the dedup index.
//!
//! The store is the only component that mutates node state. Nodes live in an
//! append-only arena indexed by [`NodeId`]; parent/child links are id lists,
//! so a checkpoint is a flat table dump in creation order.
//!
//! # Locking
//!
//! The arena sits behind a `RwLock` that is write-locked only to append a
//! node. Each node has its own `Mutex`, which is what makes the per-node
//! compare-and-swap operations safe under concurrent workers. Callers that
//! also hold the frontier lock always take it first; the store never calls
//! back into the frontier.

use std::collections::{HashMap, VecDeque};

use parking_lot::{Mutex, RwLock};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_kernel::proof::hash::ContentHash;
use tokio::time::Instant;

use crate::error::StoreError;
use crate::node::{Claim, ClaimToken, NodeId, NodeStatus, SearchNode, Terminality};
use crate::pruner::PruneReason;

/// Result of [`NodeStore::create_node`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateOutcome {
    /// A new node, in the status it was created with or inherited.
    Created(NodeId),
    /// The patch content already exists; this is the first node that produced it.
    Duplicate(NodeId),
}

impl CreateOutcome {
    #[must_use]
    pub const fn id(self) -> NodeId {
        match self {
            Self::Created(id) | Self::Duplicate(id) => id,
        }
    }

    #[must_use]
    pub const fn is_duplicate(self) -> bool {
        matches!(self, Self::Duplicate(_))
    }
}

/// Evaluation attached to a child at creation (see [`NodeStore::create_scored`]).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChildScore {
    pub score: f64,
    pub terminal: Terminality,
    /// `pending`, or the final status the child was classified into.
    pub status: NodeStatus,
    pub prune_reason: Option<PruneReason>,
}

/// A duplicate discovery: `parent` generated content already owned by `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Alias {
    pub node: NodeId,
    pub parent: NodeId,
}

/// Flat dump of the store: nodes in creation order, then aliases in discovery order.
#[derive(Debug, Clone, Default)]
pub struct StoreSnapshot {
    pub nodes: Vec<SearchNode>,
    pub aliases: Vec<Alias>,
}

/// Content digest -> arena slot of the first node with that content.
///
/// Node ids are content digests, so this doubles as the arena index.
#[derive(Debug, Default)]
struct DedupIndex {
    slots: HashMap<NodeId, usize>,
    aliases: Vec<Alias>,
}

impl DedupIndex {
    fn slot(&self, id: NodeId) -> Option<usize> {
        self.slots.get(&id).copied()
    }
}

#[derive(Debug, Default)]
struct Arena {
    slots: Vec<Mutex<SearchNode>>,
    index: DedupIndex,
    root: Option<NodeId>,
    next_seq: u64,
}

/// Append-only node arena with compare-and-swap status updates.
#[derive(Debug, Default)]
pub struct NodeStore {
    arena: RwLock<Arena>,
}

impl NodeStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a store from a validated snapshot.
    ///
    /// Child lists are derived from parent links in creation order. Claims
    /// are not persisted, so every node comes back unclaimed.
    #[must_use]
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut arena = Arena::default();
        for mut node in snapshot.nodes {
            node.claim = None;
            node.children.clear();
            if let Some(parent) = node.parent {
                if let Some(idx) = arena.index.slot(parent) {
                    arena.slots[idx].get_mut().children.push(node.id);
                }
            } else {
                arena.root = Some(node.id);
            }
            arena.next_seq = arena.next_seq.max(node.seq + 1);
            arena.index.slots.insert(node.id, arena.slots.len());
            arena.slots.push(Mutex::new(node));
        }
        arena.index.aliases = snapshot.aliases;
        Self {
            arena: RwLock::new(arena),
        }
    }

    /// Create the root node (depth 0, no parent).
    ///
    /// # Errors
    ///
    /// [`StoreError::RootExists`] if the store already has a root.
    pub fn create_root(&self, patch: Patch) -> Result<NodeId, StoreError> {
        let mut guard = self.arena.write();
        let arena = &mut *guard;
        if let Some(root) = arena.root {
            return Err(StoreError::RootExists(root));
        }
        let id = NodeId::for_patch(&patch);
        let seq = arena.next_seq;
        arena.next_seq += 1;
        arena.index.slots.insert(id, arena.slots.len());
        arena.slots.push(Mutex::new(new_node(id, None, 0, patch, seq, NodeStatus::Pending)));
        arena.root = Some(id);
        Ok(id)
    }

    /// Create an unscored child of `parent`, or report the existing node
    /// with the same content.
    ///
    /// A duplicate is recorded as an alias for lineage and is neither scored
    /// nor queued again. A child created under a `pruned` or `expired` parent
    /// inherits that status, so a pruned subtree stays fully pruned.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownParent`] if `parent` does not exist.
    pub fn create_node(&self, parent: NodeId, patch: Patch) -> Result<CreateOutcome, StoreError> {
        self.insert_child(parent, patch, None)
    }

    /// Create a child that was evaluated before insertion.
    ///
    /// The child is born with its score and the status it was classified
    /// into: `pending` to be queued for expansion, or `pruned` /
    /// `terminal-*`. Duplicates and inheritance behave as in
    /// [`NodeStore::create_node`]; an inherited status keeps the score.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownParent`] if `parent` does not exist, and
    /// [`StoreError::IllegalTransition`] if `scored.status` is not a status a
    /// node can be born with.
    pub fn create_scored(
        &self,
        parent: NodeId,
        patch: Patch,
        scored: ChildScore,
    ) -> Result<CreateOutcome, StoreError> {
        if !matches!(
            scored.status,
            NodeStatus::Pending
                | NodeStatus::Pruned
                | NodeStatus::TerminalSuccess
                | NodeStatus::TerminalFailure
        ) {
            return Err(StoreError::IllegalTransition {
                node: NodeId::for_patch(&patch),
                from: NodeStatus::Pending,
                to: scored.status,
            });
        }
        self.insert_child(parent, patch, Some(scored))
    }

    fn insert_child(
        &self,
        parent: NodeId,
        patch: Patch,
        scored: Option<ChildScore>,
    ) -> Result<CreateOutcome, StoreError> {
        let mut guard = self.arena.write();
        let arena = &mut *guard;
        let parent_idx = arena
            .index
            .slot(parent)
            .ok_or(StoreError::UnknownParent(parent))?;

        let id = NodeId::for_patch(&patch);
        if arena.index.slot(id).is_some() {
            arena.index.aliases.push(Alias { node: id, parent });
            return Ok(CreateOutcome::Duplicate(id));
        }

        let parent_node = arena.slots[parent_idx].get_mut();
        let inherited = match parent_node.status {
            NodeStatus::Pruned => Some((NodeStatus::Pruned, Some(PruneReason::Cascade))),
            NodeStatus::Expired => Some((NodeStatus::Expired, None)),
            _ => None,
        };
        let depth = parent_node.depth + 1;
        parent_node.children.push(id);

        let seq = arena.next_seq;
        arena.next_seq += 1;
        let mut node = new_node(id, Some(parent), depth, patch, seq, NodeStatus::Pending);
        if let Some(scored) = scored {
            node.score = Some(scored.score);
            node.terminal = scored.terminal;
            node.status = scored.status;
            if scored.status == NodeStatus::Pruned {
                node.prune_reason = Some(scored.prune_reason.unwrap_or(PruneReason::Manual));
            }
        }
        if let Some((status, reason)) = inherited {
            node.status = status;
            node.prune_reason = reason;
        }
        arena.index.slots.insert(id, arena.slots.len());
        arena.slots.push(Mutex::new(node));
        Ok(CreateOutcome::Created(id))
    }

    /// Copy of a node.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id.
    pub fn get_node(&self, id: NodeId) -> Result<SearchNode, StoreError> {
        self.with_node(id, |node| Ok(node.clone()))
    }

    /// Current status of a node.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id.
    pub fn status(&self, id: NodeId) -> Result<NodeStatus, StoreError> {
        self.with_node(id, |node| Ok(node.status))
    }

    /// Compare-and-swap the status of a node.
    ///
    /// Leaving `scoring` drops the claim. Entering `pruned` through this path
    /// records [`PruneReason::Manual`]; descendants are not touched (see
    /// [`NodeStore::prune_cascade`]).
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the stored status is not `expected`, and
    /// [`StoreError::IllegalTransition`] if `expected -> new` is not allowed.
    pub fn update_status(
        &self,
        id: NodeId,
        expected: NodeStatus,
        new: NodeStatus,
    ) -> Result<(), StoreError> {
        self.with_node(id, |node| {
            expect_status(node, expected)?;
            transition(node, new)?;
            if new == NodeStatus::Pruned {
                node.prune_reason = Some(PruneReason::Manual);
            }
            Ok(())
        })
    }

    /// `pending -> scoring`, attaching `claim`. Returns the claimed node.
    ///
    /// # Errors
    ///
    /// [`StoreError::Conflict`] if the node is not `pending`.
    pub fn claim(&self, id: NodeId, claim: Claim) -> Result<SearchNode, StoreError> {
        self.with_node(id, |node| {
            expect_status(node, NodeStatus::Pending)?;
            transition(node, NodeStatus::Scoring)?;
            node.claim = Some(claim);
            Ok(node.clone())
        })
    }

    /// Extend the deadline of a held claim.
    ///
    /// # Errors
    ///
    /// [`StoreError::LeaseLost`] if `token` no longer owns the node.
    pub fn renew(&self, id: NodeId, token: ClaimToken, deadline: Instant) -> Result<(), StoreError> {
        self.with_node(id, |node| {
            expect_claim(node, token)?;
            if let Some(claim) = node.claim.as_mut() {
                claim.deadline = deadline;
            }
            Ok(())
        })
    }

    /// Record the score of a node being scored under `token`.
    ///
    /// # Errors
    ///
    /// [`StoreError::LeaseLost`] if `token` no longer owns the node.
    pub fn set_score(
        &self,
        id: NodeId,
        token: ClaimToken,
        score: f64,
        terminal: Terminality,
    ) -> Result<(), StoreError> {
        self.with_node(id, |node| {
            expect_claim(node, token)?;
            node.score = Some(score);
            node.terminal = terminal;
            Ok(())
        })
    }

    /// Commit the outcome of a claim: `scoring -> next` and drop the claim.
    ///
    /// # Errors
    ///
    /// [`StoreError::LeaseLost`] if `token` no longer owns the node, and
    /// [`StoreError::IllegalTransition`] if `next` is `pending` (only lease
    /// expiry may re-queue) or otherwise not reachable from `scoring`.
    pub fn resolve(
        &self,
        id: NodeId,
        token: ClaimToken,
        next: NodeStatus,
        reason: Option<PruneReason>,
    ) -> Result<(), StoreError> {
        self.with_node(id, |node| {
            expect_claim(node, token)?;
            if next == NodeStatus::Pending {
                return Err(StoreError::IllegalTransition {
                    node: id,
                    from: node.status,
                    to: next,
                });
            }
            transition(node, next)?;
            if next == NodeStatus::Pruned {
                node.prune_reason = Some(reason.unwrap_or(PruneReason::Manual));
            }
            Ok(())
        })
    }

    /// Undo an abandoned claim: `scoring -> pending` with one more retry, or
    /// `terminal-failure` once `retry_limit` expiries have accumulated.
    ///
    /// A recorded score is kept; only the expansion is redone.
    ///
    /// # Errors
    ///
    /// [`StoreError::LeaseLost`] if `token` no longer owns the node.
    pub fn reclaim(
        &self,
        id: NodeId,
        token: ClaimToken,
        retry_limit: u32,
    ) -> Result<NodeStatus, StoreError> {
        self.with_node(id, |node| {
            expect_claim(node, token)?;
            node.retries += 1;
            let next = if node.retries >= retry_limit {
                NodeStatus::TerminalFailure
            } else {
                NodeStatus::Pending
            };
            transition(node, next)?;
            Ok(next)
        })
    }

    /// Prune `id` and every open descendant.
    ///
    /// `pending`, `scoring` and `expandable` nodes in the subtree become
    /// `pruned` (claims dropped); `terminal-*`, `pruned` and `expired` nodes
    /// are left alone. Returns the ids that changed, starting with `id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id, and
    /// [`StoreError::IllegalTransition`] if `id` itself is already final.
    pub fn prune_cascade(
        &self,
        id: NodeId,
        reason: PruneReason,
    ) -> Result<Vec<NodeId>, StoreError> {
        let arena = self.arena.read();
        let root_idx = arena.index.slot(id).ok_or(StoreError::NotFound(id))?;

        let mut pruned = Vec::new();
        let mut queue = VecDeque::new();
        {
            let mut node = arena.slots[root_idx].lock();
            transition(&mut node, NodeStatus::Pruned)?;
            node.prune_reason = Some(reason);
            pruned.push(id);
            queue.extend(node.children.iter().copied());
        }

        while let Some(child) = queue.pop_front() {
            let Some(idx) = arena.index.slot(child) else {
                continue;
            };
            let mut node = arena.slots[idx].lock();
            if matches!(
                node.status,
                NodeStatus::Pending | NodeStatus::Scoring | NodeStatus::Expandable
            ) {
                transition(&mut node, NodeStatus::Pruned)?;
                node.prune_reason = Some(PruneReason::Cascade);
                pruned.push(child);
            }
            queue.extend(node.children.iter().copied());
        }
        Ok(pruned)
    }

    /// Mark every `pending` and `scoring` node `expired` (session abort).
    pub fn expire_open(&self) -> Vec<NodeId> {
        let arena = self.arena.read();
        let mut expired = Vec::new();
        for slot in &arena.slots {
            let mut node = slot.lock();
            if matches!(node.status, NodeStatus::Pending | NodeStatus::Scoring) {
                node.status = NodeStatus::Expired;
                node.claim = None;
                expired.push(node.id);
            }
        }
        expired
    }

    /// Children of a node in creation order (aliases excluded).
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id.
    pub fn children(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        self.with_node(id, |node| Ok(node.children.clone()))
    }

    /// Scores of the already-scored siblings of `id`, excluding `id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id.
    pub fn sibling_scores(&self, id: NodeId) -> Result<Vec<f64>, StoreError> {
        let arena = self.arena.read();
        let idx = arena.index.slot(id).ok_or(StoreError::NotFound(id))?;
        let Some(parent) = arena.slots[idx].lock().parent else {
            return Ok(Vec::new());
        };
        let Some(parent_idx) = arena.index.slot(parent) else {
            return Ok(Vec::new());
        };
        let siblings = arena.slots[parent_idx].lock().children.clone();
        Ok(siblings
            .into_iter()
            .filter(|sibling| *sibling != id)
            .filter_map(|sibling| arena.index.slot(sibling))
            .filter_map(|slot| arena.slots[slot].lock().score)
            .collect())
    }

    /// Ids from `id` up to and including the root.
    ///
    /// # Errors
    ///
    /// [`StoreError::NotFound`] for an unknown id.
    pub fn path_to_root(&self, id: NodeId) -> Result<Vec<NodeId>, StoreError> {
        let arena = self.arena.read();
        let mut path = Vec::new();
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let idx = arena
                .index
                .slot(current)
                .ok_or(StoreError::NotFound(current))?;
            path.push(current);
            cursor = arena.slots[idx].lock().parent;
        }
        Ok(path)
    }

    /// Alias records pointing at `id`.
    #[must_use]
    pub fn aliases(&self, id: NodeId) -> Vec<Alias> {
        self.arena
            .read()
            .index
            .aliases
            .iter()
            .filter(|alias| alias.node == id)
            .copied()
            .collect()
    }

    /// First node that produced the given content digest.
    #[must_use]
    pub fn lookup(&self, digest: &ContentHash) -> Option<NodeId> {
        let id = NodeId::from_digest(*digest);
        self.arena.read().index.slot(id).map(|_| id)
    }

    /// Highest-scored `terminal-success` node; ties go to the earliest discovered.
    #[must_use]
    pub fn best_success(&self) -> Option<SearchNode> {
        let arena = self.arena.read();
        let mut best: Option<SearchNode> = None;
        for slot in &arena.slots {
            let node = slot.lock();
            if node.status != NodeStatus::TerminalSuccess {
                continue;
            }
            let Some(score) = node.score else { continue };
            let better = match &best {
                None => true,
                Some(current) => {
                    let current_score = current.score.unwrap_or(f64::NEG_INFINITY);
                    score.total_cmp(&current_score).is_gt()
                        || (score.total_cmp(&current_score).is_eq() && node.seq < current.seq)
                }
            };
            if better {
                best = Some(node.clone());
            }
        }
        best
    }

    /// Flat dump of every node and alias.
    #[must_use]
    pub fn snapshot(&self) -> StoreSnapshot {
        let arena = self.arena.read();
        StoreSnapshot {
            nodes: arena.slots.iter().map(|slot| slot.lock().clone()).collect(),
            aliases: arena.index.aliases.clone(),
        }
    }

    #[must_use]
    pub fn root(&self) -> Option<NodeId> {
        self.arena.read().root
    }

    /// Number of nodes (aliases excluded).
    #[must_use]
    pub fn len(&self) -> usize {
        self.arena.read().slots.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Node counts per status, in [`NodeStatus::ALL`] order.
    #[must_use]
    pub fn status_counts(&self) -> [usize; 7] {
        let mut counts = [0usize; 7];
        for slot in &self.arena.read().slots {
            counts[usize::from(slot.lock().status.tag())] += 1;
        }
        counts
    }

    fn with_node<R>(
        &self,
        id: NodeId,
        f: impl FnOnce(&mut SearchNode) -> Result<R, StoreError>,
    ) -> Result<R, StoreError> {
        let arena = self.arena.read();
        let idx = arena.index.slot(id).ok_or(StoreError::NotFound(id))?;
        let mut node = arena.slots[idx].lock();
        f(&mut *node)
    }
}

fn new_node(
    id: NodeId,
    parent: Option<NodeId>,
    depth: u32,
    patch: Patch,
    seq: u64,
    status: NodeStatus,
) -> SearchNode {
    SearchNode {
        id,
        parent,
        depth,
        patch,
        seq,
        status,
        score: None,
        terminal: Terminality::None,
        claim: None,
        retries: 0,
        prune_reason: None,
        children: Vec::new(),
    }
}

fn expect_status(node: &SearchNode, expected: NodeStatus) -> Result<(), StoreError> {
    if node.status == expected {
        Ok(())
    } else {
        Err(StoreError::Conflict {
            node: node.id,
            expected,
            actual: node.status,
        })
    }
}

fn expect_claim(node: &SearchNode, token: ClaimToken) -> Result<(), StoreError> {
    let held = node.status == NodeStatus::Scoring && node.claim.map(|c| c.token) == Some(token);
    if held {
        Ok(())
    } else {
        Err(StoreError::LeaseLost {
            node: node.id,
            token,
        })
    }
}

fn transition(node: &mut SearchNode, next: NodeStatus) -> Result<(), StoreError> {
    if !node.status.can_transition_to(next) {
        return Err(StoreError::IllegalTransition {
            node: node.id,
            from: node.status,
            to: next,
        });
    }
    node.status = next;
    if next != NodeStatus::Scoring {
        node.claim = None;
    }
    Ok(())
}
