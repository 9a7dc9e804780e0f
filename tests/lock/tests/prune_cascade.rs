//! Pruning cascade lock tests.
//!
//! Proves:
//! 1. Pruning a node prunes its open descendants and drops their entries and leases
//! 2. Terminal descendants keep their status
//! 3. Children proposed under a pruned parent are born pruned
//! 4. Operator prune through the coordinator, and its refusal after completion

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, problem};
use patchtree_harness::worlds::scripted::{Script, ScriptedWorld};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint_store::MemoryCheckpointStore;
use patchtree_search::error::EngineError;
use patchtree_search::frontier::{ClaimResult, Frontier};
use patchtree_search::node::{Claim, ClaimToken, NodeId, NodeStatus, Terminality, WorkerId};
use patchtree_search::pruner::PruneReason;
use patchtree_search::session::SessionState;
use patchtree_search::store::NodeStore;
use tokio::time::Instant;

/// Claim `node` directly in the store and commit `status`.
fn settle_as(store: &NodeStore, node: NodeId, token: u64, status: NodeStatus) {
    let token = ClaimToken(token);
    store
        .claim(
            node,
            Claim {
                worker: WorkerId(99),
                token,
                deadline: Instant::now() + Duration::from_secs(30),
            },
        )
        .unwrap();
    let terminal = match status {
        NodeStatus::TerminalSuccess => Terminality::Success,
        NodeStatus::TerminalFailure => Terminality::Failure,
        _ => Terminality::None,
    };
    store.set_score(node, token, 0.5, terminal).unwrap();
    store.resolve(node, token, status, None).unwrap();
}

fn child(store: &NodeStore, parent: NodeId, name: &str) -> NodeId {
    store.create_node(parent, Patch::from(name)).unwrap().id()
}

// ---------------------------------------------------------------------------
// 1-3. Store and frontier
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn cascade_prunes_open_work_and_spares_terminals() {
    let store = Arc::new(NodeStore::new());
    let frontier = Frontier::new(Arc::clone(&store), 3, None);

    let root = store.create_root(Patch::from("root")).unwrap();
    settle_as(&store, root, 1, NodeStatus::Expandable);
    let a = child(&store, root, "a");
    let b = child(&store, root, "b");
    let c = child(&store, root, "c");
    let d = child(&store, root, "d");

    settle_as(&store, b, 2, NodeStatus::TerminalSuccess);
    settle_as(&store, c, 3, NodeStatus::Expandable);
    let c1 = child(&store, c, "c1");
    let c2 = child(&store, c, "c2");
    settle_as(&store, c2, 4, NodeStatus::TerminalFailure);

    // d is leased through the frontier; a and c1 are queued.
    assert!(frontier.push(d, 0.4));
    let ClaimResult::Claimed(claimed) = frontier.try_claim(WorkerId(0), Duration::from_secs(30))
    else {
        panic!("d must be claimable");
    };
    assert_eq!(claimed.node, d);
    assert!(frontier.push(a, 0.9));
    assert!(frontier.push(c1, 0.5));

    let pruned = frontier.prune_subtree(root, PruneReason::Manual).unwrap();
    let pruned: HashSet<NodeId> = pruned.into_iter().collect();
    assert_eq!(pruned, HashSet::from([root, a, c, d, c1]));

    assert_eq!(store.status(b).unwrap(), NodeStatus::TerminalSuccess);
    assert_eq!(store.status(c2).unwrap(), NodeStatus::TerminalFailure);
    assert_eq!(store.get_node(root).unwrap().prune_reason, Some(PruneReason::Manual));
    for id in [a, c, d, c1] {
        let node = store.get_node(id).unwrap();
        assert_eq!(node.status, NodeStatus::Pruned);
        assert_eq!(node.prune_reason, Some(PruneReason::Cascade));
        assert!(node.claim.is_none());
    }

    assert!(frontier.is_drained());
    assert!(frontier.release(WorkerId(0), d).is_err(), "lease was revoked");

    // A late proposal under a pruned parent is born pruned and cannot be queued.
    let late = store.create_node(c, Patch::from("c3")).unwrap().id();
    assert_eq!(store.status(late).unwrap(), NodeStatus::Pruned);
    assert!(!frontier.push(late, 1.0));
}

#[test]
fn pruning_a_final_node_is_rejected() {
    let store = NodeStore::new();
    let root = store.create_root(Patch::from("root")).unwrap();
    store.prune_cascade(root, PruneReason::Manual).unwrap();
    assert!(store.prune_cascade(root, PruneReason::Manual).is_err());
}

// ---------------------------------------------------------------------------
// 4. Coordinator
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn operator_prune_stops_a_branch() {
    let world = Arc::new(
        ScriptedWorld::new()
            .with("root", Script::scored(0.5).children(["keep", "drop"]))
            .with("keep", Script::success(0.6).delayed(Duration::from_millis(10)))
            .with("drop", Script::scored(0.9).children(["deep"]).delayed(Duration::from_millis(10)))
            .with("deep", Script::success(0.95)),
    );
    let coordinator = engine(&world, Arc::new(MemoryCheckpointStore::new()), config());
    let id = coordinator.start(problem("root"), budget(100, 1)).unwrap();

    // Pause while the root is still scoring its children; its commit lands during the pause.
    tokio::time::sleep(Duration::from_millis(1)).await;
    coordinator.pause(id).unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // "keep" succeeded on arrival; "drop" is queued with its own score and never claimed.
    let keep_id = NodeId::for_patch(&Patch::from("keep"));
    assert_eq!(coordinator.node(id, keep_id).unwrap().status, NodeStatus::TerminalSuccess);
    let drop_id = NodeId::for_patch(&Patch::from("drop"));
    let queued = coordinator.node(id, drop_id).unwrap();
    assert_eq!(queued.status, NodeStatus::Pending);
    assert_eq!(queued.score, Some(0.9));
    assert_eq!(coordinator.prune(id, drop_id).unwrap(), vec![drop_id]);
    coordinator.resume(id).unwrap();
    assert_eq!(
        coordinator.wait(id, Duration::from_secs(60)).await.unwrap(),
        SessionState::Completed
    );

    let dropped = coordinator.node(id, drop_id).unwrap();
    assert_eq!(dropped.status, NodeStatus::Pruned);
    assert_eq!(dropped.prune_reason, Some(PruneReason::Manual));
    assert_eq!(world.proposals(&Patch::from("drop")), 0);
    assert_eq!(
        coordinator.best_patch(id).unwrap().patch(),
        Some(&Patch::from("keep"))
    );

    assert!(matches!(
        coordinator.prune(id, NodeId::for_patch(&Patch::from("keep"))),
        Err(EngineError::SessionTerminal { .. })
    ));
}
