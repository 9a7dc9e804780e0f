//! Harness end-to-end lock tests.
//!
//! Proves:
//! 1. `run_session` over a synthetic tree finds the planted success and
//!    persists checkpoints to disk
//! 2. Config files load, and a bad file is rejected before any session starts

use std::sync::Arc;
use std::time::Duration;

use lock_tests::fixtures::{budget, config, engine, problem};
use patchtree_harness::dir_store::DirCheckpointStore;
use patchtree_harness::runner::{load_engine_config, run_session, HarnessError};
use patchtree_harness::worlds::fanout::FanoutWorld;
use patchtree_kernel::carrier::patch::Patch;
use patchtree_search::checkpoint_store::CheckpointStore;
use patchtree_search::error::EngineError;
use patchtree_search::node::NodeId;
use patchtree_search::session::SessionState;

#[tokio::test(start_paused = true)]
async fn fanout_run_finds_planted_success() {
    let dir = tempfile::tempdir().unwrap();
    let checkpoints = Arc::new(DirCheckpointStore::new(dir.path()));
    let world = Arc::new(FanoutWorld::new(3, 2).with_success_target("root/1/2"));
    let mut config = config();
    config.pruner.min_score = None;
    let coordinator = engine(&world, checkpoints.clone(), config);

    let report = run_session(
        &coordinator,
        problem("root"),
        budget(100, 4),
        Duration::from_secs(300),
    )
    .await
    .unwrap();

    assert_eq!(report.state, SessionState::Completed);
    assert!(report.succeeded());
    assert_eq!(report.nodes_total as u64, world.tree_size());
    // The planted success resolves on arrival; every other node is expanded.
    assert_eq!(report.nodes_explored, world.tree_size() - 1);
    assert_eq!(
        report.best_path,
        ["root", "root/1", "root/1/2"]
            .iter()
            .map(|p| NodeId::for_patch(&Patch::from(*p)))
            .collect::<Vec<_>>()
    );

    let seqs = checkpoints.list(report.session).await.unwrap();
    assert!(!seqs.is_empty(), "completion checkpoint on disk");
    assert!(report.to_json().unwrap().contains("\"state\": \"completed\""));
}

#[tokio::test(start_paused = true)]
async fn budget_bounded_run_reports_partial_progress() {
    let world = Arc::new(FanoutWorld::new(4, 3));
    let mut config = config();
    config.pruner.min_score = None;
    let coordinator = engine(
        &world,
        Arc::new(patchtree_search::checkpoint_store::MemoryCheckpointStore::new()),
        config,
    );
    let report = run_session(
        &coordinator,
        problem("root"),
        budget(10, 2),
        Duration::from_secs(300),
    )
    .await
    .unwrap();
    assert_eq!(report.state, SessionState::Completed);
    assert_eq!(report.nodes_explored, 10);
    assert!(!report.succeeded());
    assert!(report.best_path.is_empty());
}

#[test]
fn config_file_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    std::fs::write(
        &path,
        r#"
[pruner]
min_score = 0.25
relative_margin = 0.1

[lease]
lease_ms = 5000
retry_limit = 4

[checkpoint]
retention = 2

[budget]
max_nodes = 50
"#,
    )
    .unwrap();
    let config = load_engine_config(&path).unwrap();
    assert_eq!(config.pruner.min_score, Some(0.25));
    assert_eq!(config.lease.retry_limit, 4);
    assert_eq!(config.checkpoint.retention, 2);
    assert_eq!(config.budget.max_nodes, 50);
    // Unset fields keep their defaults.
    assert_eq!(config.pruner.max_depth, 32);

    std::fs::write(&path, "[lease]\nretry_limit = \"three\"\n").unwrap();
    assert!(matches!(
        load_engine_config(&path),
        Err(HarnessError::Engine(EngineError::Config(_)))
    ));
}
