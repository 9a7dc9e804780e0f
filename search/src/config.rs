//! Engine configuration loaded from TOML.
//!
//! Every field has a documented default, so a partial file (or none at all)
//! yields a usable config. `validate()` rejects values the engine cannot run
//! with and logs warnings for values that are legal but suspicious.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub scorer: ScorerConfig,
    #[serde(default)]
    pub pruner: PrunerConfig,
    #[serde(default)]
    pub lease: LeaseConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    /// Budget used when a caller does not supply one.
    #[serde(default)]
    pub budget: SessionBudget,
}

impl EngineConfig {
    /// Parse and validate a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Config`] on malformed TOML and
    /// [`EngineError::InvalidConfig`] when validation fails.
    pub fn from_toml_str(text: &str) -> Result<Self, EngineError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] naming the first offending field.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.scorer.validate()?;
        self.pruner.validate()?;
        self.lease.validate()?;
        self.checkpoint.validate()?;
        self.budget.validate()?;

        if self.lease.reaper_interval() * 2 > self.lease.lease_duration() {
            tracing::warn!(
                lease_ms = self.lease.lease_ms,
                reaper_interval_ms = self.lease.reaper_interval_ms,
                "reaper interval is more than half the lease; expiries will be detected late"
            );
        }
        if self.checkpoint.quiesce_timeout() > self.checkpoint.interval() {
            tracing::warn!(
                quiesce_timeout_ms = self.checkpoint.quiesce_timeout_ms,
                interval_ms = self.checkpoint.interval_ms,
                "checkpoint quiesce timeout exceeds the checkpoint interval"
            );
        }
        Ok(())
    }
}

fn invalid(detail: impl Into<String>) -> EngineError {
    EngineError::InvalidConfig(detail.into())
}

fn require_finite(name: &str, value: f64) -> Result<(), EngineError> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(invalid(format!("{name} must be finite, got {value}")))
    }
}

// ---------------------------------------------------------------------------
// Scorer
// ---------------------------------------------------------------------------

/// Weights for [`crate::scorer::WeightedScorer`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ScorerConfig {
    /// Weight of the test pass ratio.
    #[serde(default = "default_test_weight")]
    pub test_weight: f64,
    /// Penalty per unit of static-analysis risk (risk is clamped to `[0, 1]`).
    #[serde(default = "default_risk_weight")]
    pub risk_weight: f64,
    /// Penalty per `ln(1 + diff_lines)`.
    #[serde(default = "default_diff_weight")]
    pub diff_weight: f64,
    /// Penalty per `ln(1 + cost)`.
    #[serde(default = "default_cost_weight")]
    pub cost_weight: f64,
    /// A success needs at least this many passing tests.
    #[serde(default = "default_success_min_tests_passed")]
    pub success_min_tests_passed: u32,
    /// A success needs risk at or below this.
    #[serde(default = "default_success_max_risk")]
    pub success_max_risk: f64,
}

fn default_test_weight() -> f64 {
    1.0
}
fn default_risk_weight() -> f64 {
    0.5
}
fn default_diff_weight() -> f64 {
    0.02
}
fn default_cost_weight() -> f64 {
    0.02
}
fn default_success_min_tests_passed() -> u32 {
    1
}
fn default_success_max_risk() -> f64 {
    0.2
}

impl Default for ScorerConfig {
    fn default() -> Self {
        Self {
            test_weight: default_test_weight(),
            risk_weight: default_risk_weight(),
            diff_weight: default_diff_weight(),
            cost_weight: default_cost_weight(),
            success_min_tests_passed: default_success_min_tests_passed(),
            success_max_risk: default_success_max_risk(),
        }
    }
}

impl ScorerConfig {
    fn validate(&self) -> Result<(), EngineError> {
        for (name, value) in [
            ("scorer.test_weight", self.test_weight),
            ("scorer.risk_weight", self.risk_weight),
            ("scorer.diff_weight", self.diff_weight),
            ("scorer.cost_weight", self.cost_weight),
            ("scorer.success_max_risk", self.success_max_risk),
        ] {
            require_finite(name, value)?;
            if value < 0.0 {
                return Err(invalid(format!("{name} must be non-negative, got {value}")));
            }
        }
        if self.test_weight == 0.0 {
            tracing::warn!("scorer.test_weight is 0; test outcomes will not affect ordering");
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Pruner
// ---------------------------------------------------------------------------

/// Thresholds for [`crate::pruner::Pruner`].
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct PrunerConfig {
    /// Hard minimum score. `None` disables the hard cutoff.
    #[serde(default)]
    pub min_score: Option<f64>,
    /// Nodes deeper than this are pruned.
    #[serde(default = "default_max_depth")]
    pub max_depth: u32,
    /// Prune when more than this far below the best sibling.
    #[serde(default = "default_relative_margin")]
    pub relative_margin: f64,
    /// Scored children (self included) required before the relative cutoff applies.
    #[serde(default = "default_min_siblings")]
    pub min_siblings: usize,
}

fn default_max_depth() -> u32 {
    32
}
fn default_relative_margin() -> f64 {
    0.25
}
fn default_min_siblings() -> usize {
    3
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            min_score: None,
            max_depth: default_max_depth(),
            relative_margin: default_relative_margin(),
            min_siblings: default_min_siblings(),
        }
    }
}

impl PrunerConfig {
    fn validate(&self) -> Result<(), EngineError> {
        if let Some(min) = self.min_score {
            require_finite("pruner.min_score", min)?;
        }
        require_finite("pruner.relative_margin", self.relative_margin)?;
        if self.relative_margin < 0.0 {
            return Err(invalid("pruner.relative_margin must be non-negative"));
        }
        if self.min_siblings < 2 {
            tracing::warn!(
                min_siblings = self.min_siblings,
                "pruner.min_siblings below 2 makes the relative cutoff compare a node with nothing"
            );
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Leases
// ---------------------------------------------------------------------------

/// Claim lease and reaper settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LeaseConfig {
    /// Lease granted per claim.
    #[serde(default = "default_lease_ms")]
    pub lease_ms: u64,
    /// Expiries tolerated before a node is marked `terminal-failure`.
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
    /// How long a worker waits on an empty frontier before re-checking.
    #[serde(default = "default_claim_wait_ms")]
    pub claim_wait_ms: u64,
    /// Reaper tick.
    #[serde(default = "default_reaper_interval_ms")]
    pub reaper_interval_ms: u64,
}

fn default_lease_ms() -> u64 {
    30_000
}
fn default_retry_limit() -> u32 {
    3
}
fn default_claim_wait_ms() -> u64 {
    50
}
fn default_reaper_interval_ms() -> u64 {
    100
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            lease_ms: default_lease_ms(),
            retry_limit: default_retry_limit(),
            claim_wait_ms: default_claim_wait_ms(),
            reaper_interval_ms: default_reaper_interval_ms(),
        }
    }
}

impl LeaseConfig {
    #[must_use]
    pub fn lease_duration(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    #[must_use]
    pub fn claim_wait(&self) -> Duration {
        Duration::from_millis(self.claim_wait_ms)
    }

    #[must_use]
    pub fn reaper_interval(&self) -> Duration {
        Duration::from_millis(self.reaper_interval_ms)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.lease_ms == 0 {
            return Err(invalid("lease.lease_ms must be positive"));
        }
        if self.retry_limit == 0 {
            return Err(invalid("lease.retry_limit must be at least 1"));
        }
        if self.claim_wait_ms == 0 {
            return Err(invalid("lease.claim_wait_ms must be positive"));
        }
        if self.reaper_interval_ms == 0 {
            return Err(invalid("lease.reaper_interval_ms must be positive"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checkpoints
// ---------------------------------------------------------------------------

/// Checkpoint scheduling and durability settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CheckpointConfig {
    /// Periodic snapshot interval.
    #[serde(default = "default_checkpoint_interval_ms")]
    pub interval_ms: u64,
    /// Store writes attempted before the session is failed.
    #[serde(default = "default_write_attempts")]
    pub write_attempts: u32,
    /// Backoff before retry `n` is `n * retry_backoff_ms`.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// How long a snapshot waits for in-flight leases before capturing them mid-flight.
    #[serde(default = "default_quiesce_timeout_ms")]
    pub quiesce_timeout_ms: u64,
    /// Checkpoints kept per session; older ones are removed after each write.
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_checkpoint_interval_ms() -> u64 {
    30_000
}
fn default_write_attempts() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    50
}
fn default_quiesce_timeout_ms() -> u64 {
    2_000
}
fn default_retention() -> usize {
    5
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_checkpoint_interval_ms(),
            write_attempts: default_write_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            quiesce_timeout_ms: default_quiesce_timeout_ms(),
            retention: default_retention(),
        }
    }
}

impl CheckpointConfig {
    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    #[must_use]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    #[must_use]
    pub fn quiesce_timeout(&self) -> Duration {
        Duration::from_millis(self.quiesce_timeout_ms)
    }

    fn validate(&self) -> Result<(), EngineError> {
        if self.interval_ms == 0 {
            return Err(invalid("checkpoint.interval_ms must be positive"));
        }
        if self.write_attempts == 0 {
            return Err(invalid("checkpoint.write_attempts must be at least 1"));
        }
        if self.retention == 0 {
            return Err(invalid("checkpoint.retention must keep at least 1 checkpoint"));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Session budget
// ---------------------------------------------------------------------------

/// Resource budget for one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionBudget {
    /// Distinct nodes that may be claimed (root included).
    #[serde(default = "default_max_nodes")]
    pub max_nodes: u64,
    /// Active (non-paused) wall-clock time.
    #[serde(default = "default_max_wall_clock_ms")]
    pub max_wall_clock_ms: u64,
    /// Worker units, i.e. concurrent expansions.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: u32,
}

fn default_max_nodes() -> u64 {
    1_000
}
fn default_max_wall_clock_ms() -> u64 {
    600_000
}
fn default_max_concurrency() -> u32 {
    4
}

impl Default for SessionBudget {
    fn default() -> Self {
        Self {
            max_nodes: default_max_nodes(),
            max_wall_clock_ms: default_max_wall_clock_ms(),
            max_concurrency: default_max_concurrency(),
        }
    }
}

impl SessionBudget {
    #[must_use]
    pub fn max_wall_clock(&self) -> Duration {
        Duration::from_millis(self.max_wall_clock_ms)
    }

    /// # Errors
    ///
    /// Returns [`EngineError::InvalidConfig`] if any limit is zero.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_nodes == 0 {
            return Err(invalid("budget.max_nodes must be at least 1"));
        }
        if self.max_wall_clock_ms == 0 {
            return Err(invalid("budget.max_wall_clock_ms must be positive"));
        }
        if self.max_concurrency == 0 {
            return Err(invalid("budget.max_concurrency must be at least 1"));
        }
        Ok(())
    }
}
