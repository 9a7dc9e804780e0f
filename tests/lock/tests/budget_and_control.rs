//! Budget accounting and session control lock tests.
//!
//! Proves:
//! 1. Node budget: 5 nodes, root proposes 10 children -> every child is
//!    scored on arrival, exactly 4 are claimed and expanded, the 6 still
//!    pending are pruned for budget, session completes
//! 2. Wall-clock budget stops new claims and completes the session
//! 3. pause / resume / abort / list / delete behave as a lifecycle

use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, problem};
use patchtree_harness::worlds::scripted::{Script, ScriptedWorld};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint::CheckpointId;
use patchtree_search::checkpoint_reader::read_checkpoint;
use patchtree_search::checkpoint_store::{CheckpointStore, MemoryCheckpointStore};
use patchtree_search::config::SessionBudget;
use patchtree_search::error::EngineError;
use patchtree_search::node::{NodeId, NodeStatus};
use patchtree_search::pruner::PruneReason;
use patchtree_search::session::SessionState;

const WAIT: Duration = Duration::from_secs(600);

fn children(n: usize) -> Vec<Patch> {
    (0..n).map(|i| Patch::from(format!("child-{i}").as_str())).collect()
}

fn grandchild(i: usize) -> Patch {
    Patch::from(format!("child-{i}/fix").as_str())
}

/// Root proposes `n` children scoring 0.5. With `grandchild_delay`, each
/// child proposes one grandchild whose evaluation takes that long, so every
/// expansion of a child holds its lease for the delay.
fn wide_world(n: usize, grandchild_delay: Option<Duration>) -> Arc<ScriptedWorld> {
    let mut world = ScriptedWorld::new().with("root", Script::scored(0.5).children(children(n)));
    for (i, child) in children(n).into_iter().enumerate() {
        let mut script = Script::scored(0.5);
        if let Some(delay) = grandchild_delay {
            script = script.children([grandchild(i)]);
            world = world.with(grandchild(i), Script::scored(0.5).delayed(delay));
        }
        world = world.with(child, script);
    }
    Arc::new(world)
}

// ---------------------------------------------------------------------------
// 1. Node budget
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn node_budget_caps_claims() {
    let world = wide_world(10, None);
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(5, 3)).unwrap();

    assert_eq!(coordinator.wait(id, WAIT).await.unwrap(), SessionState::Completed);

    let status = coordinator.status(id).unwrap();
    assert_eq!(status.nodes_explored, 5);
    assert_eq!(status.nodes_total, 11);
    assert_eq!(status.frontier_size, 0);

    let expanded: u32 = children(10).iter().map(|c| world.proposals(c)).sum();
    assert_eq!(expanded, 4, "exactly 4 children are ever claimed");

    let mut budget_pruned = 0;
    for child in children(10) {
        assert_eq!(world.evaluations(&child), 1, "scored once, on arrival");
        let node = coordinator.node(id, NodeId::for_patch(&child)).unwrap();
        assert_eq!(node.score, Some(0.5));
        if world.proposals(&child) == 1 {
            // Claimed work resolves on its own score, even the claim that spent the budget.
            assert_eq!(node.status, NodeStatus::Expandable, "{child:?}");
            assert_eq!(node.prune_reason, None);
        } else {
            assert_eq!(node.status, NodeStatus::Pruned, "{child:?}");
            assert_eq!(node.prune_reason, Some(PruneReason::BudgetExhausted));
            budget_pruned += 1;
        }
    }
    assert_eq!(budget_pruned, 6);
}

// ---------------------------------------------------------------------------
// 2. Wall-clock budget
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn wall_clock_budget_completes_session() {
    // Each child expansion takes 300 ms, so only a few fit in one second.
    let world = wide_world(10, Some(Duration::from_millis(300)));
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let budget = SessionBudget {
        max_nodes: 100,
        max_wall_clock_ms: 1_000,
        max_concurrency: 1,
    };
    let id = coordinator.start(problem("root"), budget).unwrap();

    assert_eq!(coordinator.wait(id, WAIT).await.unwrap(), SessionState::Completed);
    let status = coordinator.status(id).unwrap();
    assert!(status.nodes_explored < 11, "explored {}", status.nodes_explored);
    assert!(status.nodes_explored >= 2);
    assert_eq!(status.frontier_size, 0);
    assert_eq!(status.leased, 0);
}

// ---------------------------------------------------------------------------
// 3. Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pause_resume_abort_delete() {
    let world = wide_world(3, Some(Duration::from_secs(5)));
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let coordinator = engine(&world, checkpoints.clone(), config());
    let first = coordinator.start(problem("root"), budget(100, 1)).unwrap();
    let second = coordinator.start(problem("root"), budget(100, 1)).unwrap();

    let listed: Vec<_> = coordinator.list().into_iter().map(|row| row.session).collect();
    assert_eq!(listed.len(), 2);
    assert!(listed.contains(&first) && listed.contains(&second));

    coordinator.pause(first).unwrap();
    assert_eq!(coordinator.status(first).unwrap().state, SessionState::Paused);
    assert!(matches!(
        coordinator.resume(second),
        Err(EngineError::InvalidState {
            state: SessionState::Running,
            ..
        })
    ));
    coordinator.resume(first).unwrap();
    assert_eq!(coordinator.status(first).unwrap().state, SessionState::Running);

    // Let the root expand and one child go in flight on its grandchild.
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert!(matches!(
        coordinator.delete(first),
        Err(EngineError::SessionActive(_))
    ));

    assert_eq!(coordinator.abort(first).await.unwrap(), SessionState::Aborted);
    assert_eq!(coordinator.wait(first, WAIT).await.unwrap(), SessionState::Aborted);
    for child in children(3) {
        let node = coordinator.node(first, NodeId::for_patch(&child)).unwrap();
        assert_eq!(node.status, NodeStatus::Expired);
    }
    assert!(matches!(
        coordinator.abort(first).await,
        Err(EngineError::SessionTerminal { .. })
    ));

    // The abort checkpoint records the session as aborted.
    let seq = *checkpoints.list(first).await.unwrap().last().unwrap();
    let id = CheckpointId { session: first, seq };
    let image = read_checkpoint(id, &checkpoints.raw(id).unwrap()).unwrap();
    assert_eq!(image.header.state, SessionState::Aborted);

    coordinator.delete(first).unwrap();
    assert!(matches!(
        coordinator.status(first),
        Err(EngineError::UnknownSession(_))
    ));
    assert_eq!(coordinator.list().len(), 1);
    coordinator.abort(second).await.unwrap();
}
