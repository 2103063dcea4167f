//! Replay: drive synthetic matches through the full engine and print the
//! snapshot stream. Useful for eyeballing tiers and calibration without a
//! live feed.
//!
//! REPLAY_MATCHES (default 3), REPLAY_TICKS (default 40), REPLAY_SEED (default 7).

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;
use tracing_subscriber::EnvFilter;

use esports_edge::config::{env_parse, AppConfig};
use esports_edge::engine::Engine;
use esports_edge::live::messages::SessionInput;
use esports_edge::live::types::{MarketState, MatchId, RawTelemetry, Side};
use esports_edge::model::artifact::ModelArtifact;
use esports_edge::model::corpus::TrainingCorpus;
use esports_edge::model::registry::ModelRegistry;

const TICK_SECS: f64 = 60.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let matches: usize = env_parse("REPLAY_MATCHES")?.unwrap_or(3);
    let ticks: usize = env_parse("REPLAY_TICKS")?.unwrap_or(40);
    let seed: u64 = env_parse("REPLAY_SEED")?.unwrap_or(7);

    let cfg = AppConfig::from_env()?;
    let registry = Arc::new(ModelRegistry::new(cfg.registry.clone(), ModelArtifact::bootstrap()));
    let corpus = TrainingCorpus::in_memory();
    let engine = Engine::start(&cfg, registry, corpus.clone());

    let mut feed = engine.broadcaster.subscribe_all();
    let printer = tokio::spawn(async move {
        let mut printed = 0u64;
        while let Some(s) = feed.recv().await {
            printed += 1;
            let (raw, cal) = s.prediction.map(|p| (p.raw, p.calibrated)).unwrap_or((0.5, 0.5));
            let tier = s.signal.as_ref().map(|g| format!("{:?}", g.tier)).unwrap_or_else(|| "-".into());
            println!(
                "{:<8} seq={:<3} t={:>5.0}s gold={:>+8.0} raw={:.3} cal={:.3} mkt={:.3}{} tier={}",
                s.match_id,
                s.seq,
                s.game_time,
                s.gold_diff,
                raw,
                cal,
                s.market.implied_probability,
                if s.market.is_mock { "(mock)" } else { "" },
                tier,
            );
        }
        printed
    });

    let mut rng = StdRng::seed_from_u64(seed);
    let ids: Vec<MatchId> = (0..matches).map(|i| MatchId::new(format!("replay-{i}"))).collect();
    let mut gold = vec![0.0f64; matches];
    let mut kills = vec![(0u32, 0u32); matches];

    for (i, id) in ids.iter().enumerate() {
        if i % 2 == 1 {
            let odds_r = rng.gen_range(1.3..3.5);
            let odds_d = 1.0 / (1.05 - 1.0 / odds_r);
            engine
                .state
                .sessions
                .ingest(id.clone(), SessionInput::Market(MarketState::from_decimal_odds(odds_r, odds_d)))
                .await;
        }
    }

    for tick in 1..=ticks {
        for (i, id) in ids.iter().enumerate() {
            gold[i] += rng.gen_range(-1_500.0..1_800.0);
            if rng.gen_bool(0.3) {
                if gold[i] >= 0.0 { kills[i].0 += 1 } else { kills[i].1 += 1 }
            }
            let t = RawTelemetry {
                elapsed_secs: tick as f64 * TICK_SECS,
                radiant_score: kills[i].0,
                dire_score: kills[i].1,
                radiant_net_worth: 20_000.0 + tick as f64 * 1_000.0 + gold[i].max(0.0),
                dire_net_worth: 20_000.0 + tick as f64 * 1_000.0 + (-gold[i]).max(0.0),
                radiant_xp: 15_000.0 + tick as f64 * 800.0 + gold[i].max(0.0) * 0.6,
                dire_xp: 15_000.0 + tick as f64 * 800.0 + (-gold[i]).max(0.0) * 0.6,
                ..Default::default()
            };
            engine.state.sessions.ingest(id.clone(), SessionInput::Telemetry(t)).await;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    for (i, id) in ids.iter().enumerate() {
        let winner = if gold[i] >= 0.0 { Side::Radiant } else { Side::Dire };
        engine.state.sessions.end(id, Some(winner)).await;
    }

    let stats = engine.shutdown().await;
    let printed = printer.await.unwrap_or(0);
    info!(
        "🏁 Replay done | matches={} snapshots={} corpus_rows={} collector={:?}",
        matches,
        printed,
        corpus.len(),
        stats
    );
    Ok(())
}
