//! Checkpoint round-trip lock tests.
//!
//! Proves:
//! 1. encode -> decode -> rebuild yields the same frontier pop order, claim
//!    sequence, best success and dedup aliases
//! 2. A session snapshotted mid-flight and restored into a fresh engine
//!    reaches the same best patch as the uninterrupted session, with the
//!    in-flight node re-queued and its retries untouched
//! 3. A completed session restored from its final checkpoint stays completed

use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, image_of, problem};
use patchtree_harness::dir_store::DirCheckpointStore;
use patchtree_harness::worlds::scripted::{Script, ScriptedWorld};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint::CheckpointId;
use patchtree_search::checkpoint_reader::read_checkpoint;
use patchtree_search::checkpoint_writer::encode_checkpoint;
use patchtree_search::frontier::{ClaimResult, Frontier};
use patchtree_search::node::{Claim, ClaimToken, NodeId, NodeStatus, Terminality, WorkerId};
use patchtree_search::session::{SessionId, SessionState};
use patchtree_search::store::{NodeStore, StoreSnapshot};
use tokio::time::Instant;

fn commit(store: &NodeStore, node: NodeId, token: u64, score: f64, status: NodeStatus) {
    let token = ClaimToken(token);
    let claim = Claim {
        worker: WorkerId(7),
        token,
        deadline: Instant::now() + Duration::from_secs(30),
    };
    store.claim(node, claim).unwrap();
    let terminal = if status == NodeStatus::TerminalSuccess {
        Terminality::Success
    } else {
        Terminality::None
    };
    store.set_score(node, token, score, terminal).unwrap();
    store.resolve(node, token, status, None).unwrap();
}

fn drain(frontier: &Frontier) -> Vec<NodeId> {
    let mut order = Vec::new();
    while let ClaimResult::Claimed(claimed) =
        frontier.try_claim(WorkerId(0), Duration::from_secs(30))
    {
        order.push(claimed.node);
    }
    order
}

// ---------------------------------------------------------------------------
// 1. Format round-trip
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn restored_frontier_pops_in_the_same_order() {
    let store = Arc::new(NodeStore::new());
    let frontier = Frontier::new(Arc::clone(&store), 3, None);
    let root = store.create_root(Patch::from("root")).unwrap();
    commit(&store, root, 1, 0.4, NodeStatus::Expandable);

    let mut children = Vec::new();
    for (i, priority) in [0.3, 0.8, 0.3, 0.5, 0.8, 0.1].into_iter().enumerate() {
        let child = store
            .create_node(root, Patch::from(format!("c{i}").as_str()).meta("slot", i.to_string()))
            .unwrap()
            .id();
        assert!(frontier.push(child, priority));
        children.push(child);
    }
    let winner = store.create_node(root, Patch::from("winner")).unwrap().id();
    commit(&store, winner, 2, 0.9, NodeStatus::TerminalSuccess);
    // Same content proposed again by a child: recorded as an alias.
    assert!(store.create_node(children[0], Patch::from("winner")).unwrap().is_duplicate());

    let session = SessionId::new();
    let image = image_of(&frontier, session, 1);
    let bytes = encode_checkpoint(&image).unwrap();
    let decoded = read_checkpoint(CheckpointId { session, seq: 1 }, &bytes).unwrap();
    assert_eq!(decoded.header.node_count, 8);
    assert_eq!(decoded.header.frontier_count, 6);
    assert_eq!(decoded.header.alias_count, 1);

    let restored_store = Arc::new(NodeStore::from_snapshot(StoreSnapshot {
        nodes: decoded.nodes,
        aliases: decoded.aliases,
    }));
    let restored = Frontier::restore(
        Arc::clone(&restored_store),
        3,
        None,
        &decoded.frontier,
        decoded.header.nodes_consumed,
    );

    assert_eq!(restored.pop_order(), frontier.pop_order());
    assert_eq!(
        restored_store.best_success().map(|n| n.id),
        store.best_success().map(|n| n.id)
    );
    assert_eq!(restored_store.aliases(winner), store.aliases(winner));
    assert_eq!(restored_store.children(root).unwrap(), store.children(root).unwrap());

    // Ties broken by creation order: c1 before c4, c0 before c2.
    let order = drain(&frontier);
    assert_eq!(
        order,
        vec![children[1], children[4], children[3], children[0], children[2], children[5]]
    );
    assert_eq!(drain(&restored), order);
}

#[tokio::test(start_paused = true)]
async fn encoding_is_deterministic() {
    let store = Arc::new(NodeStore::new());
    let frontier = Frontier::new(Arc::clone(&store), 3, None);
    let root = store.create_root(Patch::from("root")).unwrap();
    frontier.push(root, 0.0);

    let session = SessionId::new();
    let a = encode_checkpoint(&image_of(&frontier, session, 4)).unwrap();
    let b = encode_checkpoint(&image_of(&frontier, session, 4)).unwrap();
    assert_eq!(a, b);
    let decoded = read_checkpoint(CheckpointId { session, seq: 4 }, &a).unwrap();
    assert_eq!(encode_checkpoint(&decoded).unwrap(), a);
}

// ---------------------------------------------------------------------------
// 2. Engine round-trip
// ---------------------------------------------------------------------------

fn world() -> Arc<ScriptedWorld> {
    Arc::new(
        ScriptedWorld::new()
            .with("root", Script::scored(0.4).children(["a", "b", "c"]))
            .with("a", Script::scored(0.6).children(["a1"]))
            .with("b", Script::scored(0.3).children(["b1"]))
            .with("c", Script::success(0.5))
            .with("a1", Script::success(0.9).delayed(Duration::from_secs(10)))
            .with("b1", Script::scored(0.35)),
    )
}

#[tokio::test(start_paused = true)]
async fn snapshot_restores_into_fresh_engine() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(DirCheckpointStore::new(dir.path()));
    let original = engine(&world(), checkpoints.clone(), config());
    let id = original.start(problem("root"), budget(100, 1)).unwrap();

    // Root expands; "a" is claimed and stays in flight for 10 s scoring "a1".
    tokio::time::sleep(Duration::from_millis(1)).await;
    original.pause(id).unwrap();
    let a = NodeId::for_patch(&Patch::from("a"));
    assert_eq!(original.node(id, a).unwrap().status, NodeStatus::Scoring);
    let checkpoint = original.snapshot(id).await.unwrap();
    assert!(checkpoints.path_for(checkpoint).exists());

    let fresh = engine(&world(), checkpoints.clone(), config());
    let restored = fresh.restore(checkpoint).await.unwrap();
    assert_eq!(restored.session, id);
    assert_eq!(restored.state, SessionState::Running);
    let requeued = fresh.node(id, a).unwrap();
    assert_eq!(requeued.status, NodeStatus::Pending);
    assert_eq!(requeued.retries, 0, "a snapshot is not a failed attempt");
    assert_eq!(requeued.score, Some(0.6), "only the expansion is redone");

    assert_eq!(
        fresh.wait(id, Duration::from_secs(120)).await.unwrap(),
        SessionState::Completed
    );

    original.resume(id).unwrap();
    assert_eq!(
        original.wait(id, Duration::from_secs(120)).await.unwrap(),
        SessionState::Completed
    );

    assert_eq!(fresh.best_patch(id).unwrap(), original.best_patch(id).unwrap());
    assert_eq!(
        fresh.best_patch(id).unwrap().patch(),
        Some(&Patch::from("a1"))
    );
    assert_eq!(fresh.best_path(id).unwrap(), original.best_path(id).unwrap());
    assert_eq!(
        fresh.status(id).unwrap().nodes_total,
        original.status(id).unwrap().nodes_total
    );
}

#[tokio::test(start_paused = true)]
async fn completed_session_resumes_from_store_unchanged() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(DirCheckpointStore::new(dir.path()));
    let first = engine(&world(), checkpoints.clone(), config());
    let id = first.start(problem("root"), budget(100, 2)).unwrap();
    assert_eq!(
        first.wait(id, Duration::from_secs(120)).await.unwrap(),
        SessionState::Completed
    );
    let best = first.best_patch(id).unwrap();

    let second = engine(&world(), checkpoints, config());
    let restored = second.resume_from_store(id).await.unwrap();
    assert_eq!(restored.state, SessionState::Completed, "a finished session does no more work");
    assert_eq!(
        second.wait(id, Duration::from_secs(120)).await.unwrap(),
        SessionState::Completed
    );
    assert_eq!(second.best_patch(id).unwrap(), best);
    assert_eq!(
        second.status(id).unwrap().nodes_explored,
        first.status(id).unwrap().nodes_explored
    );
}
