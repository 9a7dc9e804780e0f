//! Checkpoint corruption and durability lock tests.
//!
//! Proves:
//! 1. A corrupt newest checkpoint falls back to the newest valid older one
//! 2. A torn file on disk is rejected, never silently accepted
//! 3. No valid checkpoint at all is a typed error
//! 4. Repeated checkpoint write failure moves the session to `failed`

use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, problem};
use patchtree_harness::dir_store::DirCheckpointStore;
use patchtree_harness::worlds::scripted::{Script, ScriptedWorld};
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint::{CheckpointId, CheckpointParseError};
use patchtree_search::checkpoint_reader::read_checkpoint;
use patchtree_search::checkpoint_store::{CheckpointStore, MemoryCheckpointStore};
use patchtree_search::coordinator::Coordinator;
use patchtree_search::error::EngineError;
use patchtree_search::session::{SessionId, SessionState};

fn world() -> Arc<ScriptedWorld> {
    Arc::new(
        ScriptedWorld::new()
            .with("root", Script::scored(0.4).children(["a", "b"]))
            .with("a", Script::scored(0.5).children(["a1"]))
            .with("a1", Script::scored(0.5).delayed(Duration::from_secs(10)))
            .with("b", Script::success(0.7)),
    )
}

/// Two checkpoints of one paused session: root only, then root + children.
async fn two_checkpoints(
    checkpoints: Arc<dyn CheckpointStore>,
) -> (Coordinator, SessionId, CheckpointId, CheckpointId) {
    let coordinator = engine(&world(), checkpoints, config());
    let id = coordinator.start(problem("root"), budget(100, 1)).unwrap();
    // Taken before any worker has run.
    let first = coordinator.snapshot(id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1)).await;
    coordinator.pause(id).unwrap();
    let second = coordinator.snapshot(id).await.unwrap();
    assert!(second.seq > first.seq);
    (coordinator, id, first, second)
}

// ---------------------------------------------------------------------------
// 1. Fallback
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn corrupt_checkpoint_falls_back_to_older() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (_original, id, first, second) = two_checkpoints(checkpoints.clone()).await;

    let bytes = checkpoints.raw(second).unwrap();
    assert_eq!(read_checkpoint(second, &bytes).unwrap().nodes.len(), 3);
    assert!(checkpoints.corrupt(second));
    assert!(read_checkpoint(second, &checkpoints.raw(second).unwrap()).is_err());

    let fresh = engine(&world(), checkpoints.clone(), config());
    let restored = fresh.restore(second).await.unwrap();
    assert_eq!(restored.session, id);
    assert_eq!(restored.nodes_total, 1, "restored from {first}");

    // The fallback session still runs to completion.
    assert_eq!(
        fresh.wait(id, Duration::from_secs(120)).await.unwrap(),
        SessionState::Completed
    );
    assert_eq!(
        fresh.best_patch(id).unwrap().patch(),
        Some(&Patch::from("b"))
    );
}

// ---------------------------------------------------------------------------
// 2. Torn write on disk
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn torn_file_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(DirCheckpointStore::new(dir.path()));
    let (_original, id, _first, second) = two_checkpoints(checkpoints.clone()).await;

    let path = checkpoints.path_for(second);
    let bytes = std::fs::read(&path).unwrap();
    std::fs::write(&path, &bytes[..bytes.len() - 7]).unwrap();
    assert!(matches!(
        read_checkpoint(second, &std::fs::read(&path).unwrap()),
        Err(CheckpointParseError::BadFooterMagic
            | CheckpointParseError::RecordTruncated { .. }
            | CheckpointParseError::RecordCountMismatch { .. }
            | CheckpointParseError::ChainHashMismatch)
    ));

    let fresh = engine(&world(), checkpoints, config());
    let restored = fresh.resume_from_store(id).await.unwrap();
    assert_eq!(restored.nodes_total, 1);
    fresh.abort(id).await.unwrap();
}

// ---------------------------------------------------------------------------
// 3. Nothing valid
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn no_valid_checkpoint_is_reported() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    let (_original, id, first, second) = two_checkpoints(checkpoints.clone()).await;
    assert!(checkpoints.corrupt(first));
    assert!(checkpoints.corrupt(second));

    let fresh = engine(&world(), checkpoints, config());
    assert!(matches!(
        fresh.resume_from_store(id).await,
        Err(EngineError::NoValidCheckpoint(s)) if s == id
    ));
    assert!(matches!(
        fresh.resume_from_store(SessionId::new()).await,
        Err(EngineError::NoValidCheckpoint(_))
    ));
    assert!(fresh.list().is_empty());
}

// ---------------------------------------------------------------------------
// 4. Durability failure
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn failing_checkpoint_writes_fail_the_session() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    checkpoints.fail_next_puts(u32::MAX);
    let world = Arc::new(ScriptedWorld::new().with("root", Script::success(0.9)));
    let coordinator = engine(&world, checkpoints.clone(), config());
    let id = coordinator.start(problem("root"), budget(10, 1)).unwrap();

    assert_eq!(
        coordinator.wait(id, Duration::from_secs(60)).await.unwrap(),
        SessionState::Failed
    );
    assert!(checkpoints.is_empty());
    assert!(matches!(
        coordinator.pause(id),
        Err(EngineError::SessionTerminal {
            state: SessionState::Failed,
            ..
        })
    ));
}

#[tokio::test(start_paused = true)]
async fn transient_write_failure_is_retried() {
    let checkpoints = Arc::new(MemoryCheckpointStore::new());
    checkpoints.fail_next_puts(2);
    let world = Arc::new(ScriptedWorld::new().with("root", Script::success(0.9)));
    let coordinator = engine(&world, checkpoints.clone(), config());
    let id = coordinator.start(problem("root"), budget(10, 1)).unwrap();

    assert_eq!(
        coordinator.wait(id, Duration::from_secs(60)).await.unwrap(),
        SessionState::Completed
    );
    assert_eq!(checkpoints.len(), 1);
}
