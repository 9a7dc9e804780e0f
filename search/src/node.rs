//! Search node identity, status lattice, and claim types.

use std::fmt;

use patchtree_kernel::carrier::patch::Patch;
use patchtree_kernel::proof::hash::ContentHash;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::pruner::PruneReason;

/// Stable node identifier, derived from the patch content digest.
///
/// Two nodes with identical patch content would share an id, which is what
/// lets the dedup index reject the second one.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(ContentHash);

impl NodeId {
    /// Node id for a patch.
    #[must_use]
    pub fn for_patch(patch: &Patch) -> Self {
        Self(patch.content_hash())
    }

    /// Wrap an existing content digest.
    #[must_use]
    pub const fn from_digest(digest: ContentHash) -> Self {
        Self(digest)
    }

    /// The underlying content digest.
    #[must_use]
    pub const fn digest(&self) -> &ContentHash {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.short())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0.short())
    }
}

/// Node exploration status.
///
/// Legal transitions (everything else is rejected by the node store):
///
/// ```text
/// pending   -> scoring | pruned | expired
/// scoring   -> expandable | pruned | terminal-success | terminal-failure | expired
/// scoring   -> pending            (lease expiry or restore only)
/// expandable -> pruned
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeStatus {
    Pending,
    Scoring,
    Expandable,
    Pruned,
    TerminalSuccess,
    TerminalFailure,
    Expired,
}

impl NodeStatus {
    /// All statuses in tag order.
    pub const ALL: [NodeStatus; 7] = [
        Self::Pending,
        Self::Scoring,
        Self::Expandable,
        Self::Pruned,
        Self::TerminalSuccess,
        Self::TerminalFailure,
        Self::Expired,
    ];

    /// Whether the transition `self -> next` is allowed.
    #[must_use]
    pub const fn can_transition_to(self, next: NodeStatus) -> bool {
        matches!(
            (self, next),
            (
                Self::Pending,
                Self::Scoring | Self::Pruned | Self::Expired
            ) | (
                Self::Scoring,
                Self::Pending
                    | Self::Expandable
                    | Self::Pruned
                    | Self::TerminalSuccess
                    | Self::TerminalFailure
                    | Self::Expired
            ) | (Self::Expandable, Self::Pruned)
        )
    }

    /// No further transitions are possible from this status.
    #[must_use]
    pub const fn is_final(self) -> bool {
        matches!(
            self,
            Self::Pruned | Self::TerminalSuccess | Self::TerminalFailure | Self::Expired
        )
    }

    /// `terminal-success` or `terminal-failure`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::TerminalSuccess | Self::TerminalFailure)
    }

    /// Stable wire tag (checkpoint format).
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Scoring => 1,
            Self::Expandable => 2,
            Self::Pruned => 3,
            Self::TerminalSuccess => 4,
            Self::TerminalFailure => 5,
            Self::Expired => 6,
        }
    }

    /// Inverse of [`NodeStatus::tag`].
    #[must_use]
    pub fn from_tag(tag: u8) -> Option<Self> {
        Self::ALL.get(usize::from(tag)).copied()
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Scoring => "scoring",
            Self::Expandable => "expandable",
            Self::Pruned => "pruned",
            Self::TerminalSuccess => "terminal-success",
            Self::TerminalFailure => "terminal-failure",
            Self::Expired => "expired",
        }
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal classification produced by the scorer adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Terminality {
    #[default]
    None,
    Success,
    Failure,
}

impl Terminality {
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::None => 0,
            Self::Success => 1,
            Self::Failure => 2,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(Self::None),
            1 => Some(Self::Success),
            2 => Some(Self::Failure),
            _ => None,
        }
    }
}

/// Identifies one worker unit within a session's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerId(pub u32);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Token identifying one specific claim of a node. Never reused within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ClaimToken(pub u64);

impl fmt::Display for ClaimToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// Current owner of a `scoring` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Claim {
    pub worker: WorkerId,
    pub token: ClaimToken,
    pub deadline: Instant,
}

/// A point-in-time copy of one node, as returned by the node store.
#[derive(Debug, Clone)]
pub struct SearchNode {
    pub id: NodeId,
    /// `None` for the root.
    pub parent: Option<NodeId>,
    /// Root = 0, otherwise `parent.depth + 1`.
    pub depth: u32,
    pub patch: Patch,
    /// Creation order within the session; the frontier tie-breaker.
    pub seq: u64,
    pub status: NodeStatus,
    /// `None` until the node has been scored.
    pub score: Option<f64>,
    pub terminal: Terminality,
    pub claim: Option<Claim>,
    /// Number of lease expiries suffered so far.
    pub retries: u32,
    /// Set when `status == Pruned`.
    pub prune_reason: Option<PruneReason>,
    /// Children in creation order. Aliases are tracked by the dedup index.
    pub children: Vec<NodeId>,
}

impl SearchNode {
    /// Whether this node is the session root.
    #[must_use]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }
}
