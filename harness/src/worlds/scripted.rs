//! `ScriptedWorld`: a table of per-patch behaviour.
//!
//! Each patch maps to a [`Script`] describing what the evaluator reports,
//! what the scorer returns, which children the generator proposes, and how
//! many evaluations fail before one succeeds. Patches without a script
//! evaluate to default signals (a patch that does not apply).

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::contract::{PatchEvaluator, PatchGenerator, ProblemStatement};
use patchtree_search::error::ExternalError;
use patchtree_search::node::{NodeId, Terminality};
use patchtree_search::scorer::{EvaluationSignals, ScoreAdapter, ScoreOutcome, WeightedScorer};

/// Behaviour of one patch.
#[derive(Debug, Clone, Default)]
pub struct Script {
    pub signals: EvaluationSignals,
    /// Fixed scorer output. `None` defers to [`WeightedScorer`].
    pub outcome: Option<ScoreOutcome>,
    pub children: Vec<Patch>,
    /// Number of leading evaluations that fail.
    pub fail_evaluations: u32,
    /// Evaluator latency.
    pub delay: Option<Duration>,
}

impl Script {
    /// Non-terminal node with a fixed score.
    #[must_use]
    pub fn scored(value: f64) -> Self {
        Self::default().outcome(value, Terminality::None)
    }

    #[must_use]
    pub fn success(value: f64) -> Self {
        Self::default().outcome(value, Terminality::Success)
    }

    #[must_use]
    pub fn failure(value: f64) -> Self {
        Self::default().outcome(value, Terminality::Failure)
    }

    #[must_use]
    pub fn outcome(mut self, value: f64, terminal: Terminality) -> Self {
        self.outcome = Some(ScoreOutcome { value, terminal });
        self
    }

    /// Report `signals` and let the weighted scorer decide.
    #[must_use]
    pub fn signals(mut self, signals: EvaluationSignals) -> Self {
        self.signals = signals;
        self.outcome = None;
        self
    }

    #[must_use]
    pub fn children<I, P>(mut self, children: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Patch>,
    {
        self.children = children.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn fail_first(mut self, count: u32) -> Self {
        self.fail_evaluations = count;
        self
    }

    #[must_use]
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }
}

/// Generator, evaluator and scorer backed by a script table.
#[derive(Debug, Default)]
pub struct ScriptedWorld {
    scripts: HashMap<NodeId, Script>,
    fallback: WeightedScorer,
    evaluations: Mutex<HashMap<NodeId, u32>>,
    /// Generator parents in call order.
    expansions: Mutex<Vec<NodeId>>,
}

impl ScriptedWorld {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `script` to `patch`, replacing any earlier script.
    #[must_use]
    pub fn with(mut self, patch: impl Into<Patch>, script: Script) -> Self {
        let patch = patch.into();
        self.scripts.insert(NodeId::for_patch(&patch), script);
        self
    }

    #[must_use]
    pub fn with_scorer(mut self, scorer: WeightedScorer) -> Self {
        self.fallback = scorer;
        self
    }

    /// Evaluator calls made for `patch`, failed ones included.
    #[must_use]
    pub fn evaluations(&self, patch: &Patch) -> u32 {
        self.evaluations
            .lock()
            .get(&NodeId::for_patch(patch))
            .copied()
            .unwrap_or(0)
    }

    /// Generator calls made with `patch` as parent.
    #[must_use]
    pub fn proposals(&self, patch: &Patch) -> u32 {
        let id = NodeId::for_patch(patch);
        let calls = self.expansions.lock().iter().filter(|&&p| p == id).count();
        u32::try_from(calls).unwrap_or(u32::MAX)
    }

    /// Every generator parent so far, in call order.
    #[must_use]
    pub fn expansion_order(&self) -> Vec<NodeId> {
        self.expansions.lock().clone()
    }

    fn script(&self, patch: &Patch) -> Option<&Script> {
        self.scripts.get(&NodeId::for_patch(patch))
    }
}

#[async_trait]
impl PatchGenerator for ScriptedWorld {
    async fn propose(
        &self,
        _problem: &ProblemStatement,
        parent: &Patch,
    ) -> Result<Vec<Patch>, ExternalError> {
        self.expansions.lock().push(NodeId::for_patch(parent));
        Ok(self
            .script(parent)
            .map(|s| s.children.clone())
            .unwrap_or_default())
    }
}

#[async_trait]
impl PatchEvaluator for ScriptedWorld {
    async fn evaluate(
        &self,
        _problem: &ProblemStatement,
        patch: &Patch,
    ) -> Result<EvaluationSignals, ExternalError> {
        let script = self.script(patch);
        if let Some(delay) = script.and_then(|s| s.delay) {
            tokio::time::sleep(delay).await;
        }

        let attempt = {
            let mut evaluations = self.evaluations.lock();
            let count = evaluations.entry(NodeId::for_patch(patch)).or_default();
            *count += 1;
            *count
        };
        match script {
            Some(s) if attempt <= s.fail_evaluations => Err(ExternalError::evaluator(
                std::io::Error::other(format!("scripted failure {attempt}/{}", s.fail_evaluations)),
            )),
            Some(s) => Ok(s.signals.clone()),
            None => Ok(EvaluationSignals::default()),
        }
    }
}

impl ScoreAdapter for ScriptedWorld {
    fn score(&self, patch: &Patch, signals: &EvaluationSignals) -> ScoreOutcome {
        match self.script(patch).and_then(|s| s.outcome) {
            Some(outcome) => outcome,
            None => self.fallback.score(patch, signals),
        }
    }
}
