//! Edge server: telemetry ingest → live sessions → snapshots, plus the
//! collect/retrain loop and the admin API.
//!
//! ```text
//!   GSI POST ──► SessionStore ──► Broadcaster ──► SSE / pull
//!   OddsPoller ─┘     │
//!                     └─EndedSession─► Collector ─► corpus ─► Retrainer ─► ModelRegistry
//! ```

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use esports_edge::admin::serve_admin;
use esports_edge::config::AppConfig;
use esports_edge::engine::Engine;
use esports_edge::model::corpus::TrainingCorpus;
use esports_edge::model::registry::ModelRegistry;
use esports_edge::model::store::ArtifactStore;
use esports_edge::upstream::{CachedJsonClient, OddsPoller, UpstreamConfig};

fn init_logging(cfg: &AppConfig) -> anyhow::Result<WorkerGuard> {
    std::fs::create_dir_all(&cfg.service.log_dir)
        .with_context(|| format!("creating log dir {}", cfg.service.log_dir.display()))?;
    let file = tracing_appender::rolling::daily(&cfg.service.log_dir, "edge_server.log");
    let (writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().with_writer(writer).with_ansi(false))
        .init();
    Ok(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    // Bad settings abort before anything is spawned.
    let cfg = AppConfig::from_env()?;
    let _log_guard = init_logging(&cfg)?;

    info!("🚀 edge_server starting | data_dir={}", cfg.service.data_dir.display());

    let store = ArtifactStore::open(cfg.service.models_dir())?;
    let registry = Arc::new(ModelRegistry::open(cfg.registry.clone(), store)?);
    let corpus = TrainingCorpus::open(cfg.service.corpus_path())?;
    let engine = Engine::start(&cfg, registry.clone(), corpus);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Surface registry alerts in the log.
    let mut alerts = registry.subscribe_alerts();
    let mut alert_stop = shutdown_rx.clone();
    let alert_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                changed = alerts.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if let Some(alert) = alerts.borrow_and_update().clone() {
                        warn!("🚨 Registry alert: {:?}", alert.kind);
                    }
                }
                _ = alert_stop.changed() => break,
            }
        }
    });

    let poller = match cfg.service.odds_url.clone() {
        Some(url) => {
            let client = CachedJsonClient::new(
                url,
                UpstreamConfig { cache_ttl: cfg.service.upstream_cache_ttl, ..Default::default() },
            );
            let poller = OddsPoller::new(client, engine.state.sessions.clone(), cfg.service.odds_poll, shutdown_rx.clone());
            Some(tokio::spawn(poller.run()))
        }
        None => {
            info!("💱 No EDGE_ODDS_URL set; sessions use the mock market");
            None
        }
    };

    let mut admin_stop = shutdown_rx.clone();
    let mut admin = tokio::spawn(serve_admin(engine.state.clone(), cfg.service.admin_addr, async move {
        let _ = admin_stop.changed().await;
    }));

    let admin_result = tokio::select! {
        res = tokio::signal::ctrl_c() => {
            if let Err(e) = res {
                warn!("ctrl-c handler failed: {e}");
            }
            info!("🛑 Ctrl-C received, shutting down");
            let _ = shutdown_tx.send(true);
            admin.await
        }
        res = &mut admin => {
            // Admin server died on its own (bind failure etc.); take the rest down too.
            let _ = shutdown_tx.send(true);
            res
        }
    };
    match admin_result {
        Ok(Err(e)) => warn!("admin server error: {e:#}"),
        Err(e) => warn!("admin task failed: {e}"),
        Ok(Ok(())) => {}
    }
    if let Some(p) = poller {
        let _ = p.await;
    }
    let _ = alert_task.await;

    match engine.shutdown().await {
        Some(stats) => info!(
            "🏁 edge_server stopped | ended={} appended={} duplicates={} no_outcome={} errors={}",
            stats.received, stats.appended, stats.duplicates, stats.no_outcome, stats.errors
        ),
        None => info!("🏁 edge_server stopped"),
    }
    Ok(())
}
