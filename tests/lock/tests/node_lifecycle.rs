//! Node lifecycle lock tests.
//!
//! Proves:
//! 1. Every node reachable from the root has depth = parent depth + 1
//! 2. Status never moves backward except `scoring -> pending` (re-queue)
//! 3. Scenario: root 0.4, children 0.9 (success) and 0.1 (below cutoff);
//!    both children are resolved on arrival without a claim
//! 4. Siblings are expanded best-first by their own scores

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, problem};
use patchtree_harness::worlds::fanout::FanoutWorld;
use patchtree_harness::worlds::scripted::{Script, ScriptedWorld};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint_store::MemoryCheckpointStore;
use patchtree_search::error::StoreError;
use patchtree_search::node::{NodeId, NodeStatus};
use patchtree_search::pruner::PruneReason;
use patchtree_search::session::{BestPatch, SessionState};
use patchtree_search::store::NodeStore;

const WAIT: Duration = Duration::from_secs(600);

// ---------------------------------------------------------------------------
// 1. Depth
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn every_reachable_node_is_one_deeper_than_its_parent() {
    let world = Arc::new(FanoutWorld::new(3, 3).with_success_target("root/2/1"));
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(500, 4)).unwrap();
    assert_eq!(coordinator.wait(id, WAIT).await.unwrap(), SessionState::Completed);

    let root = NodeId::for_patch(&Patch::from("root"));
    let mut queue = VecDeque::from([root]);
    let mut visited = 0usize;
    while let Some(next) = queue.pop_front() {
        let node = coordinator.node(id, next).unwrap();
        visited += 1;
        match node.parent {
            None => assert_eq!(node.depth, 0),
            Some(parent) => {
                let parent = coordinator.node(id, parent).unwrap();
                assert_eq!(node.depth, parent.depth + 1, "node {}", node.id);
                assert!(parent.children.contains(&node.id));
            }
        }
        // A completed session has no open work left.
        assert!(
            node.status == NodeStatus::Expandable || node.status.is_final(),
            "node {} left {}",
            node.id,
            node.status
        );
        queue.extend(node.children.iter().copied());
    }
    assert_eq!(visited, coordinator.status(id).unwrap().nodes_total);
}

// ---------------------------------------------------------------------------
// 2. Monotonic status
// ---------------------------------------------------------------------------

fn rank(status: NodeStatus) -> u8 {
    match status {
        NodeStatus::Pending => 0,
        NodeStatus::Scoring => 1,
        NodeStatus::Expandable => 2,
        _ => 3,
    }
}

#[test]
fn only_requeue_moves_backward() {
    for from in NodeStatus::ALL {
        for to in NodeStatus::ALL {
            if !from.can_transition_to(to) {
                continue;
            }
            let requeue = from == NodeStatus::Scoring && to == NodeStatus::Pending;
            assert!(
                requeue || rank(to) > rank(from),
                "{from} -> {to} moves backward"
            );
        }
    }
    for status in NodeStatus::ALL.into_iter().filter(|s| s.is_final()) {
        assert!(
            NodeStatus::ALL.iter().all(|to| !status.can_transition_to(*to)),
            "{status} is final but has an exit"
        );
    }
}

#[test]
fn store_rejects_backward_transition() {
    let store = NodeStore::new();
    let root = store.create_root(Patch::from("root")).unwrap();
    store
        .update_status(root, NodeStatus::Pending, NodeStatus::Pruned)
        .unwrap();
    assert!(matches!(
        store.update_status(root, NodeStatus::Pruned, NodeStatus::Pending),
        Err(StoreError::IllegalTransition { .. })
    ));
    assert!(matches!(
        store.update_status(root, NodeStatus::Pending, NodeStatus::Scoring),
        Err(StoreError::Conflict {
            actual: NodeStatus::Pruned,
            ..
        })
    ));
}

// ---------------------------------------------------------------------------
// 3. Scenario: prune below cutoff, serve best
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn low_child_pruned_and_best_patch_served() {
    let world = Arc::new(
        ScriptedWorld::new()
            .with("root", Script::scored(0.4).children(["child-a", "child-b"]))
            .with("child-a", Script::success(0.9))
            .with("child-b", Script::scored(0.1).children(["never"])),
    );
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(100, 2)).unwrap();

    assert_eq!(coordinator.wait(id, WAIT).await.unwrap(), SessionState::Completed);

    let b = coordinator
        .node(id, NodeId::for_patch(&Patch::from("child-b")))
        .unwrap();
    assert_eq!(b.status, NodeStatus::Pruned);
    assert_eq!(b.prune_reason, Some(PruneReason::HardCutoff));
    assert!(b.children.is_empty());
    assert_eq!(world.proposals(&Patch::from("child-b")), 0, "pruned node must not expand");

    match coordinator.best_patch(id).unwrap() {
        BestPatch::Found { patch, score, .. } => {
            assert_eq!(patch, Patch::from("child-a"));
            assert!((score - 0.9).abs() < f64::EPSILON);
        }
        BestPatch::NoneFound => panic!("expected child-a"),
    }
    let status = coordinator.status(id).unwrap();
    assert_eq!(status.frontier_size, 0);
    assert_eq!(status.leased, 0);
    assert_eq!(status.nodes_total, 3);
    assert_eq!(status.nodes_explored, 1, "only the root needed a claim");
    assert_eq!(world.evaluations(&Patch::from("child-b")), 1);
}

// ---------------------------------------------------------------------------
// 4. Best-first order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn higher_scored_sibling_expands_first() {
    let world = Arc::new(
        ScriptedWorld::new()
            .with("root", Script::scored(0.5).children(["lo", "hi"]))
            .with("lo", Script::scored(0.3).children(["lo1"]))
            .with("hi", Script::scored(0.9).children(["hi1"]))
            .with("lo1", Script::scored(0.25))
            .with("hi1", Script::scored(0.5)),
    );
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(100, 1)).unwrap();
    assert_eq!(coordinator.wait(id, WAIT).await.unwrap(), SessionState::Completed);

    let order: Vec<NodeId> = ["root", "hi", "hi1", "lo", "lo1"]
        .iter()
        .map(|p| NodeId::for_patch(&Patch::from(*p)))
        .collect();
    assert_eq!(world.expansion_order(), order);

    for (name, score) in [("lo", 0.3), ("hi", 0.9), ("hi1", 0.5), ("lo1", 0.25)] {
        let node = coordinator
            .node(id, NodeId::for_patch(&Patch::from(name)))
            .unwrap();
        assert_eq!(node.status, NodeStatus::Expandable, "{name}");
        assert_eq!(node.score, Some(score), "{name} is scored once, on arrival");
        assert_eq!(world.evaluations(&Patch::from(name)), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn best_patch_is_none_found_not_an_error() {
    let world = Arc::new(ScriptedWorld::new().with("root", Script::failure(0.0)));
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(10, 1)).unwrap();
    assert_eq!(coordinator.best_patch(id).unwrap(), BestPatch::NoneFound);
    assert_eq!(coordinator.wait(id, WAIT).await.unwrap(), SessionState::Completed);
    assert_eq!(coordinator.best_patch(id).unwrap(), BestPatch::NoneFound);
    assert!(coordinator.best_path(id).unwrap().is_empty());
}
