//! Dedup index lock tests.
//!
//! Proves:
//! 1. A duplicate across different parents returns the first node's id
//! 2. No second frontier entry is ever created for the same content
//! 3. End to end, identical proposals are evaluated once

use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, problem};
use patchtree_harness::worlds::scripted::{Script, ScriptedWorld};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint_store::MemoryCheckpointStore;
use patchtree_search::frontier::Frontier;
use patchtree_search::node::NodeId;
use patchtree_search::session::SessionState;
use patchtree_search::store::{Alias, CreateOutcome, NodeStore};

fn shared_fix() -> Patch {
    Patch::from("--- a/src/range.rs\n+++ b/src/range.rs\n-    i <= len\n+    i < len\n")
}

// ---------------------------------------------------------------------------
// 1-2. Store and frontier
// ---------------------------------------------------------------------------

#[test]
fn cross_parent_duplicate_returns_first_id() {
    let store = Arc::new(NodeStore::new());
    let root = store.create_root(Patch::from("root")).unwrap();
    let p1 = store.create_node(root, Patch::from("p1")).unwrap().id();
    let p2 = store.create_node(root, Patch::from("p2")).unwrap().id();

    let first = store.create_node(p1, shared_fix()).unwrap();
    let CreateOutcome::Created(first_id) = first else {
        panic!("first proposal must create a node");
    };
    let second = store.create_node(p2, shared_fix()).unwrap();
    assert_eq!(second, CreateOutcome::Duplicate(first_id));

    let node = store.get_node(first_id).unwrap();
    assert_eq!(node.parent, Some(p1));
    assert!(store.children(p2).unwrap().is_empty());
    assert_eq!(
        store.aliases(first_id),
        vec![Alias {
            node: first_id,
            parent: p2
        }]
    );
    assert_eq!(store.len(), 4);
}

#[test]
fn duplicate_never_gets_second_frontier_entry() {
    let store = Arc::new(NodeStore::new());
    let root = store.create_root(Patch::from("root")).unwrap();
    let p1 = store.create_node(root, Patch::from("p1")).unwrap().id();
    let p2 = store.create_node(root, Patch::from("p2")).unwrap().id();
    let frontier = Frontier::new(Arc::clone(&store), 3, None);

    let first = store.create_node(p1, shared_fix()).unwrap();
    assert!(frontier.push(first.id(), 0.5));

    let second = store.create_node(p2, shared_fix()).unwrap();
    assert!(second.is_duplicate());
    // Even a caller that ignores the duplicate flag cannot queue it twice.
    assert!(!frontier.push(second.id(), 0.9));
    assert_eq!(frontier.len(), 1);
    assert_eq!(frontier.pop_order(), vec![first.id()]);
}

// ---------------------------------------------------------------------------
// 3. End to end
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn identical_proposals_are_explored_once() {
    let world = Arc::new(
        ScriptedWorld::new()
            .with("root", Script::scored(0.5).children(["p1", "p2"]))
            .with("p1", Script::scored(0.6).children([shared_fix()]))
            .with("p2", Script::scored(0.7).children([shared_fix()]))
            .with(shared_fix(), Script::success(0.8)),
    );
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(100, 4)).unwrap();

    assert_eq!(
        coordinator.wait(id, Duration::from_secs(60)).await.unwrap(),
        SessionState::Completed
    );
    assert_eq!(world.evaluations(&shared_fix()), 1);
    let status = coordinator.status(id).unwrap();
    assert_eq!(status.nodes_total, 4);
    // The shared fix succeeds on arrival, so only root, p1 and p2 are claimed.
    assert_eq!(status.nodes_explored, 3);

    let node = coordinator.node(id, NodeId::for_patch(&shared_fix())).unwrap();
    let p1 = NodeId::for_patch(&Patch::from("p1"));
    let p2 = NodeId::for_patch(&Patch::from("p2"));
    assert!(node.parent == Some(p1) || node.parent == Some(p2));
    assert_eq!(node.depth, 2);
}
