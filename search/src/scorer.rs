//! Scorer adapter: evaluation signals in, ordering score and terminality out.

use patchtree_kernel::carrier::patch::Patch;
use serde::{Deserialize, Serialize};

use crate::config::ScorerConfig;
use crate::node::Terminality;

/// Raw signal record returned by the external evaluator.
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
pub struct EvaluationSignals {
    /// Whether the patch applied cleanly.
    pub applies: bool,
    pub tests_passed: u32,
    pub tests_failed: u32,
    /// Static-analysis risk, nominally in `[0, 1]`.
    pub risk: f64,
    pub diff_lines: u32,
    /// Estimated token/compute cost of the candidate.
    pub cost: f64,
}

/// Scorer output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreOutcome {
    /// Ordering value. Only meaningful relative to other nodes in the same session.
    pub value: f64,
    pub terminal: Terminality,
}

/// Turns evaluation signals into a score.
///
/// # Contract
///
/// - Pure: the same `(patch, signals)` must always produce the same outcome,
///   so checkpoint replay can re-run it for verification.
/// - `value` must be finite.
pub trait ScoreAdapter: Send + Sync {
    fn score(&self, patch: &Patch, signals: &EvaluationSignals) -> ScoreOutcome;
}

/// Linear combination of normalized signals.
///
/// `value = w_t * pass_ratio - w_r * risk - w_d * ln(1 + diff_lines) - w_c * ln(1 + cost)`
#[derive(Debug, Clone)]
pub struct WeightedScorer {
    config: ScorerConfig,
}

impl WeightedScorer {
    #[must_use]
    pub fn new(config: ScorerConfig) -> Self {
        Self { config }
    }
}

impl Default for WeightedScorer {
    fn default() -> Self {
        Self::new(ScorerConfig::default())
    }
}

impl ScoreAdapter for WeightedScorer {
    fn score(&self, _patch: &Patch, signals: &EvaluationSignals) -> ScoreOutcome {
        let c = &self.config;

        let total = u64::from(signals.tests_passed) + u64::from(signals.tests_failed);
        #[allow(clippy::cast_precision_loss)]
        let pass_ratio = if total == 0 {
            0.0
        } else {
            f64::from(signals.tests_passed) / total as f64
        };
        // Unknown risk is treated as maximal.
        let risk = if signals.risk.is_finite() {
            signals.risk.clamp(0.0, 1.0)
        } else {
            1.0
        };
        let cost = if signals.cost.is_finite() {
            signals.cost.max(0.0)
        } else {
            0.0
        };

        let value = c.test_weight * pass_ratio
            - c.risk_weight * risk
            - c.diff_weight * f64::from(signals.diff_lines).ln_1p()
            - c.cost_weight * cost.ln_1p();

        let terminal = if !signals.applies {
            Terminality::Failure
        } else if signals.tests_failed == 0
            && signals.tests_passed >= c.success_min_tests_passed
            && risk <= c.success_max_risk
        {
            Terminality::Success
        } else {
            Terminality::None
        };

        ScoreOutcome { value, terminal }
    }
}
