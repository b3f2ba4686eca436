mod helpers;

use std::sync::Arc;
use strata::learning::{DriftStatus, EngineDeps, FeedbackOptions, LearningEngine, SafetyState};
use strata::LearningError;
use tempfile::TempDir;

use helpers::{open_engine, patterns, test_config, FailingSink, FixedProbe, RecordingSink};

#[tokio::test]
async fn first_feedback_on_a_new_route_nudges_weight_negative() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&test_config(tmp.path())).await;

    let id = engine
        .create_trajectory("coding.review", patterns(&["p1"]), vec![])
        .await
        .unwrap();
    let result = engine
        .provide_feedback(&id, 0.9, FeedbackOptions::default().with_similarity("p1", 1.0))
        .await
        .unwrap();

    // reward 0.9 × 1 × 0.5 = 0.45, gradient −0.05, Δw = 0.01 × −0.05 / (1 + 0.1 × 0.1)
    assert!((result.reward - 0.45).abs() < 1e-12);
    assert_eq!(result.weights_updated, 1);
    let expected = -0.0005 / 1.01;
    assert!((engine.get_weight("p1", "coding.review") as f64 - expected).abs() < 1e-7);

    // fisher 0.9 × 0.1 + 0.1 × 0.05² = 0.09025
    let stats = engine.get_stats().await;
    assert!((stats.mean_fisher - 0.09025).abs() < 1e-6);
    assert_eq!(stats.routes, 1);

    let stored = engine.get_trajectory(&id).await.unwrap().unwrap();
    assert!(stored.processed);
    assert_eq!(stored.quality, Some(0.9));
}

#[tokio::test]
async fn unknown_weights_read_as_zero() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&test_config(tmp.path())).await;
    assert_eq!(engine.get_weight("nope", "nowhere"), 0.0);
    assert!(engine.get_weights("nowhere").is_empty());
}

#[tokio::test]
async fn success_rate_follows_route_history() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&test_config(tmp.path())).await;

    let first = engine.create_trajectory("r", patterns(&["p"]), vec![]).await.unwrap();
    engine.provide_feedback(&first, 1.0, FeedbackOptions::default()).await.unwrap();
    let second = engine.create_trajectory("r", patterns(&["p"]), vec![]).await.unwrap();
    let result = engine
        .provide_feedback(&second, 1.0, FeedbackOptions::default())
        .await
        .unwrap();

    // the route has one observation of 1.0, so the success rate is 1.0
    assert!((result.reward - 1.0).abs() < 1e-12);
    assert!(engine.get_weight("p", "r") > 0.0);
}

#[tokio::test]
async fn minted_patterns_reach_the_sink_and_sink_failures_are_ignored() {
    let tmp = TempDir::new().unwrap();
    let sink = Arc::new(RecordingSink::default());
    let engine = LearningEngine::open(
        test_config(tmp.path()),
        EngineDeps {
            pattern_sink: sink.clone(),
            memory_probe: Some(Arc::new(FixedProbe(0.1))),
            ..EngineDeps::default()
        },
    )
    .await
    .unwrap();

    let low = engine.create_trajectory("r", patterns(&["a"]), vec![]).await.unwrap();
    let high = engine.create_trajectory("r", patterns(&["a", "b", "b2"]), vec![]).await.unwrap();
    assert!(!engine.provide_feedback(&low, 0.5, FeedbackOptions::default()).await.unwrap().pattern_created);
    let result = engine.provide_feedback(&high, 0.85, FeedbackOptions::default()).await.unwrap();
    assert!(result.pattern_created);
    assert_eq!(sink.created.lock().as_slice(), &[result.pattern_id.clone().unwrap()]);

    let failing = TempDir::new().unwrap();
    let engine = LearningEngine::open(
        test_config(failing.path()),
        EngineDeps {
            pattern_sink: Arc::new(FailingSink),
            memory_probe: Some(Arc::new(FixedProbe(0.1))),
            ..EngineDeps::default()
        },
    )
    .await
    .unwrap();
    let id = engine.create_trajectory("r", patterns(&["a"]), vec![]).await.unwrap();
    let result = engine.provide_feedback(&id, 0.95, FeedbackOptions::default()).await.unwrap();
    assert!(result.pattern_created);
}

#[tokio::test]
async fn concurrent_feedback_is_serialized() {
    let tmp = TempDir::new().unwrap();
    let engine = Arc::new(open_engine(&test_config(tmp.path())).await);

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(engine.create_trajectory("r", patterns(&["shared"]), vec![]).await.unwrap());
    }
    let mut handles = Vec::new();
    for id in ids {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .provide_feedback(&id, 0.7, FeedbackOptions::default().without_auto_save())
                .await
                .unwrap()
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let stats = engine.get_stats().await;
    assert_eq!(stats.weights, 1);
    let weight = engine.get_weight("shared", "r");
    assert!((-1.0..=1.0).contains(&weight));
}

/// A config whose updates are large enough to drive drift past the reject threshold in
/// a handful of calls.
fn aggressive(tmp: &TempDir) -> strata::StrataConfig {
    let mut config = test_config(tmp.path());
    config.learning.learning_rate = 1.0;
    config.learning.default_success_rate = 1.0;
    config.safety.checkpoint_on_start = false;
    config
}

async fn reward(engine: &LearningEngine, pattern: &str) -> Result<strata::learning::WeightUpdateResult, LearningError> {
    let id = engine.create_trajectory("r", patterns(&[pattern]), vec![]).await.unwrap();
    engine.provide_feedback(&id, 1.0, FeedbackOptions::default()).await
}

#[tokio::test]
async fn critical_drift_rolls_back_to_the_baseline() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&aggressive(&tmp)).await;

    reward(&engine, "p1").await.unwrap();
    let p1 = engine.get_weight("p1", "r");
    assert!(p1 > 0.4);
    let baseline = engine.create_checkpoint("trained", true).await.unwrap();

    let mild = reward(&engine, "p2").await.unwrap();
    assert_eq!(mild.drift.as_ref().unwrap().status, DriftStatus::Ok);
    assert!(!mild.rolled_back);

    let critical = reward(&engine, "p2").await.unwrap();
    assert!(critical.rolled_back);
    let drift = critical.drift.unwrap();
    assert_eq!(drift.status, DriftStatus::Critical);
    assert_eq!(drift.baseline_id, baseline);

    assert_eq!(engine.get_weight("p2", "r"), 0.0);
    assert_eq!(engine.get_weight("p1", "r"), p1);
    let stats = engine.get_stats().await;
    assert_eq!(stats.rollback_count, 1);
    assert_eq!(stats.safety_state, SafetyState::RolledBack);
}

#[tokio::test]
async fn refused_auto_rollback_surfaces_drift_exceeded() {
    let tmp = TempDir::new().unwrap();
    let mut config = aggressive(&tmp);
    config.safety.max_rollbacks_per_window = 1;
    let engine = open_engine(&config).await;

    reward(&engine, "p1").await.unwrap();
    engine.create_checkpoint("trained", true).await.unwrap();
    reward(&engine, "p2").await.unwrap();
    assert!(reward(&engine, "p2").await.unwrap().rolled_back);

    reward(&engine, "p2").await.unwrap();
    let err = reward(&engine, "p2").await.unwrap_err();
    assert!(matches!(err, LearningError::DriftExceeded { .. }), "{err}");
    assert!(err.is_safety());
    // the update itself stands
    assert!(engine.get_weight("p2", "r") > 0.9);
}

#[tokio::test]
async fn disabled_auto_rollback_only_reports() {
    let tmp = TempDir::new().unwrap();
    let mut config = aggressive(&tmp);
    config.safety.auto_rollback = false;
    let engine = open_engine(&config).await;

    reward(&engine, "p1").await.unwrap();
    engine.create_checkpoint("trained", true).await.unwrap();
    reward(&engine, "p2").await.unwrap();
    let result = reward(&engine, "p2").await.unwrap();
    assert!(!result.rolled_back);
    assert_eq!(result.drift.unwrap().status, DriftStatus::Critical);
    assert_eq!(engine.get_stats().await.safety_state, SafetyState::Drifting);

    let metrics = engine.check_drift(true).await.unwrap();
    assert_eq!(metrics.status, DriftStatus::Critical);
    assert_eq!(engine.get_weight("p2", "r"), 0.0);
}

#[tokio::test]
async fn default_config_measures_drift_from_the_first_trained_checkpoint() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(tmp.path());
    config.learning.learning_rate = 1.0;
    config.learning.default_success_rate = 1.0;
    let engine = open_engine(&config).await;
    let initial = engine.list_checkpoints().await[0].id.clone();

    // only the empty start-up baseline exists: nothing to measure against
    assert!(reward(&engine, "p1").await.unwrap().drift.is_none());
    assert!(matches!(
        engine.check_drift(false).await,
        Err(LearningError::Checkpoint(_))
    ));

    // not requested as a baseline, but it is the first checkpoint with weights
    let trained = engine.create_checkpoint("trained", false).await.unwrap();
    let checkpoints = engine.list_checkpoints().await;
    assert!(checkpoints.iter().any(|c| c.id == trained && c.is_baseline));
    assert!(checkpoints.iter().any(|c| c.id == initial && !c.is_baseline));

    let mild = reward(&engine, "p2").await.unwrap();
    assert_eq!(mild.drift.unwrap().status, DriftStatus::Ok);
    let critical = reward(&engine, "p2").await.unwrap();
    assert!(critical.rolled_back);
    assert_eq!(critical.drift.unwrap().baseline_id, trained);
    assert_eq!(engine.get_weight("p2", "r"), 0.0);
}

#[tokio::test]
async fn check_drift_without_baseline_is_an_error() {
    let tmp = TempDir::new().unwrap();
    let engine = open_engine(&aggressive(&tmp)).await;
    assert!(matches!(
        engine.check_drift(false).await,
        Err(LearningError::Checkpoint(_))
    ));
}
