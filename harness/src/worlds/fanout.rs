//! `FanoutWorld`: a synthetic tree of fixed shape.
//!
//! Every node at depth `< max_depth` proposes `fanout` children named
//! `<parent>/<i>`. Signals are derived from the patch digest, so scores are
//! stable across runs but spread out enough to exercise ordering and
//! pruning. The patch named by `success_target` (if any) reports a clean
//! test run and scores as `terminal-success`.

use async_trait::async_trait;
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::contract::{PatchEvaluator, PatchGenerator, ProblemStatement};
use patchtree_search::error::ExternalError;
use patchtree_search::scorer::{EvaluationSignals, ScoreAdapter, ScoreOutcome, WeightedScorer};

#[derive(Debug, Clone)]
pub struct FanoutWorld {
    pub fanout: u32,
    pub max_depth: u32,
    pub success_target: Option<String>,
    scorer: WeightedScorer,
}

impl FanoutWorld {
    #[must_use]
    pub fn new(fanout: u32, max_depth: u32) -> Self {
        Self {
            fanout,
            max_depth,
            success_target: None,
            scorer: WeightedScorer::default(),
        }
    }

    #[must_use]
    pub fn with_success_target(mut self, target: impl Into<String>) -> Self {
        self.success_target = Some(target.into());
        self
    }

    /// Number of nodes in the full tree, root included.
    #[must_use]
    pub fn tree_size(&self) -> u64 {
        let fanout = u64::from(self.fanout);
        let mut level = 1u64;
        let mut total = 1u64;
        for _ in 0..self.max_depth {
            level = level.saturating_mul(fanout);
            total = total.saturating_add(level);
        }
        total
    }

    fn depth_of(patch: &Patch) -> u32 {
        let slashes = patch.bytes().iter().filter(|&&b| b == b'/').count();
        u32::try_from(slashes).unwrap_or(u32::MAX)
    }

    fn is_target(&self, patch: &Patch) -> bool {
        self.success_target
            .as_deref()
            .is_some_and(|target| patch.as_text() == Some(target))
    }

    /// Deterministic signals for `patch`.
    #[must_use]
    pub fn signals_for(&self, patch: &Patch) -> EvaluationSignals {
        if self.is_target(patch) {
            return EvaluationSignals {
                applies: true,
                tests_passed: 20,
                tests_failed: 0,
                risk: 0.05,
                diff_lines: 4,
                cost: 10.0,
            };
        }
        let digest = patch.content_hash();
        let d = digest.as_bytes();
        EvaluationSignals {
            applies: true,
            tests_passed: u32::from(d[0] % 16),
            // At least one failure, so only the target can succeed.
            tests_failed: 1 + u32::from(d[1] % 8),
            risk: f64::from(d[2]) / 255.0,
            diff_lines: u32::from(d[3]),
            cost: f64::from(d[4]),
        }
    }
}

#[async_trait]
impl PatchGenerator for FanoutWorld {
    async fn propose(
        &self,
        _problem: &ProblemStatement,
        parent: &Patch,
    ) -> Result<Vec<Patch>, ExternalError> {
        if Self::depth_of(parent) >= self.max_depth {
            return Ok(Vec::new());
        }
        let base = parent.as_text().unwrap_or("node");
        Ok((0..self.fanout)
            .map(|i| Patch::from(format!("{base}/{i}").as_str()))
            .collect())
    }
}

#[async_trait]
impl PatchEvaluator for FanoutWorld {
    async fn evaluate(
        &self,
        _problem: &ProblemStatement,
        patch: &Patch,
    ) -> Result<EvaluationSignals, ExternalError> {
        Ok(self.signals_for(patch))
    }
}

impl ScoreAdapter for FanoutWorld {
    fn score(&self, patch: &Patch, signals: &EvaluationSignals) -> ScoreOutcome {
        self.scorer.score(patch, signals)
    }
}
