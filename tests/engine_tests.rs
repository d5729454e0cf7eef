mod common;

use std::sync::Arc;

use chrono::{DateTime, Utc};
use common::{disruption_events, disruption_graph, s1_events, s1_graph};
use railops_backend::engine::{EngineConfig, RuntimeEngine};
use railops_backend::store::ArtifactStore;

fn now() -> DateTime<Utc> {
    "2024-01-01T08:00:00Z".parse().unwrap()
}

fn test_engine(
    graph: railops_backend::graph::SectionGraph,
    events: Vec<railops_backend::models::TrainEvent>,
    dir: &tempfile::TempDir,
) -> Arc<RuntimeEngine> {
    let cfg = EngineConfig {
        scope: "test_section".to_string(),
        date: "2024-01-01".to_string(),
        persist_artifacts: false,
        ..Default::default()
    };
    Arc::new(RuntimeEngine::new(
        cfg,
        Arc::new(graph),
        events,
        ArtifactStore::new(dir.path()),
    ))
}

#[tokio::test]
async fn test_hysteresis_identical_ticks_share_plan_version() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(s1_graph(), s1_events(), &dir);

    engine.tick_at(now()).await.unwrap();
    let first = engine.snapshot().await;
    assert!(!first.plan.actions.is_empty());
    let trail_before = engine
        .ledger()
        .trail(&engine.cfg.scope, &engine.cfg.date)
        .len();

    engine.tick_at(now()).await.unwrap();
    let second = engine.snapshot().await;

    assert_eq!(first.plan.plan_version, second.plan.plan_version);
    assert_eq!(
        engine.ledger().trail(&engine.cfg.scope, &engine.cfg.date).len(),
        trail_before
    );
    assert_eq!(second.tick, first.tick + 1);
}

#[tokio::test]
async fn test_disruption_and_revert_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(disruption_graph(), disruption_events(), &dir);

    engine.tick_at(now()).await.unwrap();
    let baseline = engine.snapshot().await;
    assert!(baseline.plan.actions.is_empty());
    let baseline_version = baseline.plan.plan_version.clone();

    engine
        .inject_disruption("T1", "S1", 5.0, now())
        .await
        .unwrap();
    let disrupted = engine.snapshot().await;
    assert!(!disrupted.plan.actions.is_empty());
    assert_ne!(disrupted.plan.plan_version, baseline_version);
    // the prior plan is retained for revert
    assert_eq!(disrupted.plan_prev.plan_version, baseline_version);

    let reverted = engine.revert_plan().await;
    assert_eq!(reverted.plan_version, baseline_version);
    let snapshot = engine.snapshot().await;
    assert_eq!(snapshot.plan.plan_version, baseline_version);
    assert_eq!(
        snapshot.plan_prev.plan_version,
        disrupted.plan.plan_version
    );
}

#[tokio::test]
async fn test_apply_action_is_sandboxed() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(s1_graph(), s1_events(), &dir);
    engine.tick_at(now()).await.unwrap();

    let snapshot = engine.snapshot().await;
    let action_id = snapshot.plan.actions[0]
        .action_id
        .clone()
        .expect("actions carry ids");

    let result = engine.apply_action(&action_id, None).await;
    assert_eq!(result["status"], "sandbox");
    assert_eq!(result["applied"], false);

    let unknown = engine.apply_action("deadbeef", None).await;
    assert_eq!(unknown["status"], "unknown_action");
}

#[tokio::test]
async fn test_snapshot_positions_follow_clock() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(s1_graph(), s1_events(), &dir);
    let mid_run: DateTime<Utc> = "2024-01-01T08:05:00Z".parse().unwrap();
    engine.tick_at(mid_run).await.unwrap();

    let snapshot = engine.snapshot().await;
    let t1 = snapshot
        .positions
        .iter()
        .find(|p| p.train_id == "T1")
        .expect("T1 position");
    assert_eq!(t1.block_id, "B1");
    assert!(t1.progress_pct > 0.0 && t1.progress_pct < 1.0);
}

#[tokio::test]
async fn test_engine_clears_error_after_good_tick() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(s1_graph(), s1_events(), &dir);
    engine.tick_at(now()).await.unwrap();
    assert!(engine.last_error().await.is_none());
}

#[tokio::test]
async fn test_stop_signal_terminates_loop() {
    let dir = tempfile::tempdir().unwrap();
    let engine = test_engine(s1_graph(), s1_events(), &dir);
    let handle = engine.start();
    engine.stop();
    tokio::time::timeout(std::time::Duration::from_secs(5), handle)
        .await
        .expect("engine loop exits on stop signal")
        .unwrap();
}
