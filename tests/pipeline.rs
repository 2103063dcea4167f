use std::sync::Arc;
use std::time::Duration;

use tokio::time::{sleep, timeout};

use esports_edge::config::AppConfig;
use esports_edge::engine::Engine;
use esports_edge::live::comparator::Tier;
use esports_edge::live::features::FEATURE_COUNT;
use esports_edge::live::messages::{MatchSnapshot, SessionInput};
use esports_edge::live::types::{Lifecycle, MatchId, RawTelemetry, Side};
use esports_edge::model::artifact::{CalibratorBlob, ClassifierBlob, LogisticModel, ModelArtifact};
use esports_edge::model::corpus::TrainingCorpus;
use esports_edge::model::predictor::{score, Predictor};
use esports_edge::model::registry::{ModelRegistry, RegistryConfig};
use esports_edge::model::retrainer::RetrainOutcome;

fn bootstrap_registry() -> Arc<ModelRegistry> {
    Arc::new(ModelRegistry::new(RegistryConfig::default(), ModelArtifact::bootstrap()))
}

fn tick(elapsed: f64, gold_lead: f64) -> RawTelemetry {
    RawTelemetry {
        elapsed_secs: elapsed,
        radiant_score: 10,
        dire_score: 10,
        radiant_net_worth: 40_000.0 + gold_lead.max(0.0),
        dire_net_worth: 40_000.0 + (-gold_lead).max(0.0),
        radiant_xp: 30_000.0 + gold_lead.max(0.0) * 0.5,
        dire_xp: 30_000.0 + (-gold_lead).max(0.0) * 0.5,
        ..Default::default()
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn test_lead_on_mock_market_favors_radiant() {
    let engine = Engine::start(&AppConfig::default(), bootstrap_registry(), TrainingCorpus::in_memory());
    let id = MatchId::new("e2e");
    let mut sub = engine.broadcaster.subscribe(&id);

    engine.state.sessions.ingest(id.clone(), SessionInput::Telemetry(tick(1_800.0, 20_000.0))).await;

    let snap = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
    assert_eq!(snap.lifecycle, Lifecycle::Live);
    let p = snap.prediction.unwrap();
    assert!(p.calibrated > 0.5, "calibrated {}", p.calibrated);
    assert!(snap.market.is_mock);
    let sig = snap.signal.unwrap();
    assert!(sig.index > 0.0);
    assert_eq!(sig.favored, Side::Radiant);
    assert!(sig.tier >= Tier::Lean, "tier {:?}", sig.tier);
    assert!(sig.is_mock);

    engine.shutdown().await;
}

#[tokio::test]
async fn test_out_of_order_ticks_apply_in_arrival_order() {
    let engine = Engine::start(&AppConfig::default(), bootstrap_registry(), TrainingCorpus::in_memory());
    let id = MatchId::new("ooo");
    let mut sub = engine.broadcaster.subscribe(&id);

    // one tick at a time so no pass coalesces two of them
    let mut seen: Vec<Arc<MatchSnapshot>> = Vec::new();
    for t in [10.0, 5.0, 20.0] {
        engine.state.sessions.ingest(id.clone(), SessionInput::Telemetry(tick(t, 1_000.0))).await;
        let snap = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
        assert_eq!(snap.game_time, t, "latest arrival wins, no re-sorting by game time");
        seen.push(snap);
    }
    assert_eq!(seen[1].game_time, 5.0);
    assert_eq!(engine.broadcaster.latest(&id).unwrap().game_time, 20.0);

    for s in &seen {
        let p = s.prediction.unwrap();
        assert!(p.calibrated.is_finite() && (0.0..=1.0).contains(&p.calibrated));
        assert!(s.features.unwrap().as_slice().iter().all(|v| v.is_finite()));
    }
    assert!(seen.windows(2).all(|w| w[0].seq < w[1].seq));
    assert_eq!(engine.state.sessions.lifecycle(&id), Some(Lifecycle::Live));

    engine.shutdown().await;
}

fn logistic(version: u64) -> ModelArtifact {
    ModelArtifact {
        version,
        classifier: ClassifierBlob::Logistic(LogisticModel {
            version,
            weights: (0..FEATURE_COUNT).map(|i| 0.05 * (i as f64 + 1.0)).collect(),
            bias: -0.2,
            means: vec![0.0; FEATURE_COUNT],
            scales: vec![1.0; FEATURE_COUNT],
        }),
        calibrator: CalibratorBlob::Identity { version },
        trained_at: chrono::Utc::now(),
        training_rows: 100,
        validation_score: Some(0.7),
        metrics: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_hot_swap_under_load() {
    let registry = bootstrap_registry();
    let predictor = Predictor::new(registry.clone());
    let features: Vec<f64> = (0..FEATURE_COUNT).map(|i| 0.1 * i as f64).collect();

    let old = registry.get();
    let new = logistic(1);
    let expect_old = score(&old, &features).unwrap();
    let expect_new = score(&new, &features).unwrap();
    assert_ne!(expect_old.raw, expect_new.raw);

    let mut workers = Vec::new();
    for _ in 0..8 {
        let predictor = predictor.clone();
        let features = features.clone();
        workers.push(tokio::spawn(async move {
            let mut out = Vec::with_capacity(125);
            for _ in 0..125 {
                out.push(predictor.predict(&features));
                tokio::task::yield_now().await;
            }
            out
        }));
    }
    sleep(Duration::from_millis(1)).await;
    registry.publish(new).await.unwrap();

    let mut total = 0;
    for w in workers {
        for r in w.await.unwrap() {
            total += 1;
            let p = r.expect("no inference failures during swap");
            let expected = match p.model_version {
                0 => &expect_old,
                1 => &expect_new,
                v => panic!("unexpected version {v}"),
            };
            // classifier and calibrator came from the same artifact
            assert_eq!(p.raw, expected.raw);
            assert_eq!(p.calibrated, expected.calibrated);
        }
    }
    assert_eq!(total, 1000);
    assert_eq!(registry.get().version, 1);
    assert_eq!(predictor.predict(&features).unwrap().model_version, 1);
}

#[tokio::test]
async fn test_inactive_session_hands_off_once_and_evicts() {
    let mut cfg = AppConfig::default();
    cfg.session.inactivity_timeout = Duration::from_millis(200);
    cfg.session.stale_after = Duration::from_millis(50);
    cfg.session.grace_period = Duration::from_millis(50);
    let engine = Engine::start(&cfg, bootstrap_registry(), TrainingCorpus::in_memory());
    let id = MatchId::new("idle");

    engine.state.sessions.ingest(id.clone(), SessionInput::Telemetry(tick(900.0, 3_000.0))).await;
    wait_for("session to go live", || engine.state.sessions.lifecycle(&id) == Some(Lifecycle::Live)).await;
    wait_for("eviction", || engine.state.sessions.session_count() == 0).await;
    assert!(engine.broadcaster.latest(&id).is_none());

    let stats = engine.shutdown().await.unwrap();
    assert_eq!(stats.received, 1);
    assert_eq!(stats.no_outcome, 1);
    assert_eq!(stats.appended, 0);
}

#[tokio::test]
async fn test_finished_matches_feed_a_published_model() {
    let mut cfg = AppConfig::default();
    cfg.retrain.split.min_rows = 40;
    let registry = bootstrap_registry();
    let corpus = TrainingCorpus::in_memory();
    let engine = Engine::start(&cfg, registry.clone(), corpus.clone());

    for i in 0..60 {
        let id = MatchId::new(format!("m{i}"));
        let lead = if i % 2 == 0 { 4_000.0 + i as f64 * 300.0 } else { -(4_000.0 + i as f64 * 300.0) };
        engine.state.sessions.ingest(id.clone(), SessionInput::Telemetry(tick(1_500.0, lead))).await;
        let winner = if lead > 0.0 { Side::Radiant } else { Side::Dire };
        engine.state.sessions.ingest(id, SessionInput::End { winner: Some(winner) }).await;
    }
    wait_for("corpus to fill", || corpus.len() == 60).await;

    let outcome = engine.state.retrain.trigger().await.unwrap();
    match outcome {
        RetrainOutcome::Published { version, score } => {
            assert_eq!(version, 1);
            assert!(score > 0.5, "holdout auc {score}");
        }
        other => panic!("expected publish, got {other:?}"),
    }
    assert_eq!(registry.get().version, 1);
    assert!(registry.get().is_consistent());

    let id = MatchId::new("after");
    let mut sub = engine.broadcaster.subscribe(&id);
    engine.state.sessions.ingest(id.clone(), SessionInput::Telemetry(tick(1_500.0, 8_000.0))).await;
    let snap = timeout(Duration::from_secs(2), sub.recv()).await.unwrap().unwrap();
    assert_eq!(snap.model_version(), Some(1));

    engine.shutdown().await;
}
