//! Pruning policy.
//!
//! Freshly scored nodes go through [`Pruner::should_prune`]: hard cutoff,
//! depth cutoff, relative (sibling) cutoff, first match wins. Budget
//! exhaustion is decided separately by [`Pruner::budget_cutoff`] and applies
//! only to nodes still `pending`; a node under a claim always resolves on
//! its own outcome. The pruner is pure; applying a decision (and cascading
//! it) is the job of the frontier and node store.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::PrunerConfig;

/// Why a node was pruned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PruneReason {
    /// Score below the configured minimum.
    HardCutoff,
    /// Depth beyond the configured maximum.
    DepthCutoff,
    /// Score too far below the best sibling.
    RelativeCutoff,
    /// Session node or wall-clock budget reached.
    BudgetExhausted,
    /// Operator-directed prune.
    Manual,
    /// An ancestor was pruned.
    Cascade,
}

impl PruneReason {
    /// Stable wire tag (checkpoint format). Zero is reserved for "none".
    #[must_use]
    pub const fn tag(self) -> u8 {
        match self {
            Self::HardCutoff => 1,
            Self::DepthCutoff => 2,
            Self::RelativeCutoff => 3,
            Self::BudgetExhausted => 4,
            Self::Manual => 5,
            Self::Cascade => 6,
        }
    }

    #[must_use]
    pub const fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::HardCutoff),
            2 => Some(Self::DepthCutoff),
            3 => Some(Self::RelativeCutoff),
            4 => Some(Self::BudgetExhausted),
            5 => Some(Self::Manual),
            6 => Some(Self::Cascade),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::HardCutoff => "hard-cutoff",
            Self::DepthCutoff => "depth-cutoff",
            Self::RelativeCutoff => "relative-cutoff",
            Self::BudgetExhausted => "budget-exhausted",
            Self::Manual => "manual",
            Self::Cascade => "cascade",
        }
    }
}

impl fmt::Display for PruneReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part of a scored node the pruner looks at.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PruneCandidate {
    pub depth: u32,
    pub score: f64,
}

/// Budget consumption at decision time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetView {
    pub nodes_consumed: u64,
    pub max_nodes: u64,
    pub elapsed: Duration,
    pub max_wall_clock: Duration,
}

impl BudgetView {
    /// Whether either the node or wall-clock budget has been reached.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.nodes_consumed >= self.max_nodes || self.elapsed >= self.max_wall_clock
    }
}

/// Configured pruning policy.
#[derive(Debug, Clone)]
pub struct Pruner {
    config: PrunerConfig,
}

impl Pruner {
    #[must_use]
    pub fn new(config: PrunerConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    /// Decide whether a freshly scored node should be pruned.
    ///
    /// `sibling_scores` are the scores of the node's already-scored siblings
    /// (same parent), excluding the node itself.
    #[must_use]
    pub fn should_prune(
        &self,
        candidate: PruneCandidate,
        sibling_scores: &[f64],
    ) -> Option<PruneReason> {
        if let Some(min) = self.config.min_score {
            if candidate.score < min {
                return Some(PruneReason::HardCutoff);
            }
        }

        if candidate.depth > self.config.max_depth {
            return Some(PruneReason::DepthCutoff);
        }

        // Self counts toward the minimum: the parent has produced this many scored children.
        if sibling_scores.len() + 1 >= self.config.min_siblings {
            let best = sibling_scores
                .iter()
                .copied()
                .filter(|s| s.is_finite())
                .fold(f64::NEG_INFINITY, f64::max);
            if best.is_finite() && candidate.score < best - self.config.relative_margin {
                return Some(PruneReason::RelativeCutoff);
            }
        }

        None
    }

    /// Reason to prune every `pending` node once the budget is spent.
    #[must_use]
    pub fn budget_cutoff(budget: &BudgetView) -> Option<PruneReason> {
        budget.exhausted().then_some(PruneReason::BudgetExhausted)
    }
}
