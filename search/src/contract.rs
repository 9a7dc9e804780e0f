//! External collaborator contracts.
//!
//! The engine neither writes nor runs patches. A [`PatchGenerator`] proposes
//! children for a node and a [`PatchEvaluator`] produces the signal record
//! the scorer consumes. Both may be slow and both may fail; a failure is
//! "unable to score" and goes back through the lease retry path.

use async_trait::async_trait;
use patchtree_kernel::carrier::patch::Patch;
use patchtree_kernel::proof::hash::{hash_parts, ContentHash};
use patchtree_kernel::proof::hash_domain::HashDomain;

use crate::error::ExternalError;
use crate::scorer::EvaluationSignals;

/// The problem a session explores fixes for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProblemStatement {
    /// Caller's identifier for the problem (issue key, ticket URL, ...).
    pub reference: String,
    pub description: String,
    /// Patch the root node carries.
    pub root_patch: Patch,
}

impl ProblemStatement {
    /// Problem with an empty root patch.
    #[must_use]
    pub fn new(reference: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            reference: reference.into(),
            description: description.into(),
            root_patch: Patch::new(Vec::new()).meta("role", "root"),
        }
    }

    #[must_use]
    pub fn with_root_patch(mut self, root_patch: Patch) -> Self {
        self.root_patch = root_patch;
        self
    }

    /// Digest of the reference and description, recorded in checkpoints.
    #[must_use]
    pub fn digest(&self) -> ContentHash {
        let reference = self.reference.as_bytes();
        hash_parts(
            HashDomain::ProblemStatement,
            &[
                &(reference.len() as u64).to_le_bytes(),
                reference,
                self.description.as_bytes(),
            ],
        )
    }
}

/// Proposes child patches for a node.
///
/// # Contract
///
/// - May return zero children; the node then simply has no descendants.
/// - Need not be idempotent. Duplicate proposals are absorbed by the node
///   store's dedup index.
#[async_trait]
pub trait PatchGenerator: Send + Sync {
    async fn propose(
        &self,
        problem: &ProblemStatement,
        parent: &Patch,
    ) -> Result<Vec<Patch>, ExternalError>;
}

/// Evaluates one patch (applies it, runs tests, analyses risk).
#[async_trait]
pub trait PatchEvaluator: Send + Sync {
    async fn evaluate(
        &self,
        problem: &ProblemStatement,
        patch: &Patch,
    ) -> Result<EvaluationSignals, ExternalError>;
}
