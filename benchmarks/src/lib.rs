//! Shared helpers for patchtree benchmark suites.

use std::sync::Arc;
use std::time::Duration;

use patchtree_harness::runner::{run_session, RunReport};
use patchtree_harness::worlds::fanout::FanoutWorld;
use patchtree_kernel::carrier::patch::Patch;
use patchtree_kernel::proof::hash::canonical_hash;
use patchtree_kernel::proof::hash_domain::HashDomain;
use patchtree_search::checkpoint::{CheckpointHeader, CheckpointImage, CHECKPOINT_FORMAT};
use patchtree_search::checkpoint_store::MemoryCheckpointStore;
use patchtree_search::config::{EngineConfig, SessionBudget};
use patchtree_search::contract::ProblemStatement;
use patchtree_search::coordinator::{Collaborators, Coordinator};
use patchtree_search::frontier::Frontier;
use patchtree_search::node::NodeId;
use patchtree_search::session::{SessionId, SessionState};
use patchtree_search::store::NodeStore;

/// Distinct, reproducible patch content for input `i`.
#[must_use]
pub fn bench_patch(i: u64) -> Patch {
    let digest = canonical_hash(HashDomain::BenchInput, &i.to_le_bytes());
    Patch::new(digest.hex_digest().into_bytes()).meta("input", i.to_string())
}

/// Priority in `[0, 1)` spread by the input digest, so pushes interleave.
#[must_use]
pub fn bench_priority(i: u64) -> f64 {
    let digest = canonical_hash(HashDomain::BenchInput, &i.to_be_bytes());
    f64::from(digest.as_bytes()[0]) / 256.0
}

/// A store holding a root and `n` children, none queued yet.
///
/// # Panics
///
/// Panics if the store rejects a node. Benchmark setup failures are fatal.
#[must_use]
pub fn wide_store(n: u64) -> (Arc<NodeStore>, Vec<NodeId>) {
    let store = Arc::new(NodeStore::new());
    let root = store.create_root(Patch::from("root")).expect("root");
    let children = (0..n)
        .map(|i| store.create_node(root, bench_patch(i)).expect("child").id())
        .collect();
    (store, children)
}

/// A frontier with `n` queued children of one root.
#[must_use]
pub fn queued_frontier(n: u64) -> Frontier {
    let (store, children) = wide_store(n);
    let frontier = Frontier::new(store, 3, None);
    for (i, child) in (0..n).zip(children) {
        frontier.push(child, bench_priority(i));
    }
    frontier
}

/// Checkpoint image of `frontier`, shaped like a coordinator capture.
#[must_use]
pub fn checkpoint_image(frontier: &Frontier, session: SessionId) -> CheckpointImage {
    let capture = frontier.capture();
    let problem = problem();
    CheckpointImage {
        header: CheckpointHeader {
            format: CHECKPOINT_FORMAT.to_owned(),
            session,
            seq: 1,
            problem_reference: problem.reference.clone(),
            problem_description: problem.description.clone(),
            problem_digest: problem.digest(),
            created_at_ms: 0,
            state: SessionState::Running,
            budget: SessionBudget::default(),
            nodes_consumed: capture.nodes_consumed,
            elapsed_ms: 0,
            node_count: 0,
            frontier_count: 0,
            alias_count: 0,
        },
        nodes: capture.store.nodes,
        frontier: capture.entries,
        aliases: capture.store.aliases,
    }
}

fn problem() -> ProblemStatement {
    ProblemStatement::new("BENCH-1", "synthetic fanout tree").with_root_patch(Patch::from("root"))
}

/// Run one full session over a [`FanoutWorld`] with in-memory checkpoints.
///
/// # Panics
///
/// Panics if the engine rejects the session or it does not finish.
pub async fn run_fanout(fanout: u32, depth: u32, concurrency: u32) -> RunReport {
    let world = Arc::new(FanoutWorld::new(fanout, depth));
    let mut config = EngineConfig::default();
    config.pruner.min_score = None;
    config.pruner.min_siblings = usize::MAX;
    let coordinator = Coordinator::new(
        config,
        Collaborators {
            generator: world.clone(),
            evaluator: world.clone(),
            scorer: world.clone(),
            checkpoints: Arc::new(MemoryCheckpointStore::new()),
        },
    )
    .expect("valid config");
    let budget = SessionBudget {
        max_nodes: world.tree_size(),
        max_concurrency: concurrency,
        ..SessionBudget::default()
    };
    run_session(&coordinator, problem(), budget, Duration::from_secs(60))
        .await
        .expect("session finishes")
}
