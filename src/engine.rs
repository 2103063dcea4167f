//! Actor wiring shared by the service binary, the replay driver and the
//! integration tests.
//!
//! ```text
//! SessionStore ──EndedSession──► Collector ──► TrainingCorpus
//!      │                                            │
//!      └── Predictor ◄── ModelRegistry ◄── Retrainer ┘
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::live::broadcaster::Broadcaster;
use crate::live::comparator::MarketComparator;
use crate::live::features::FeatureExtractor;
use crate::live::session::{Pipeline, SessionStore};
use crate::model::collector::{Collector, CollectorStats};
use crate::model::corpus::TrainingCorpus;
use crate::model::predictor::Predictor;
use crate::model::registry::ModelRegistry;
use crate::model::retrainer::Retrainer;
use crate::model::training::{ClassifierTrainer, LogisticTrainer};
use crate::AppState;

const HANDOFF_QUEUE: usize = 256;

pub struct Engine {
    pub state: AppState,
    pub broadcaster: Arc<Broadcaster>,
    collector: JoinHandle<CollectorStats>,
    retrainer: JoinHandle<()>,
}

impl Engine {
    /// Spawn collector and retrainer; sessions are spawned on demand.
    pub fn start(cfg: &AppConfig, registry: Arc<ModelRegistry>, corpus: TrainingCorpus) -> Self {
        Self::start_with_trainer(cfg, registry, corpus, Arc::new(LogisticTrainer::default()))
    }

    pub fn start_with_trainer(
        cfg: &AppConfig,
        registry: Arc<ModelRegistry>,
        corpus: TrainingCorpus,
        trainer: Arc<dyn ClassifierTrainer>,
    ) -> Self {
        let broadcaster = Arc::new(Broadcaster::new(cfg.broadcaster.clone()));
        let pipeline = Arc::new(Pipeline {
            extractor: FeatureExtractor::new(cfg.features.clone()),
            predictor: Predictor::new(registry.clone()),
            comparator: MarketComparator::new(cfg.comparator.clone()),
        });
        let (ended_tx, ended_rx) = mpsc::channel(HANDOFF_QUEUE);
        let sessions = SessionStore::new(cfg.session.clone(), pipeline, broadcaster.clone(), ended_tx);

        let collector = tokio::spawn(Collector::new(corpus.clone(), ended_rx).run());
        let (retrainer, retrain) = Retrainer::new(cfg.retrain.clone(), corpus.clone(), registry.clone(), trainer);
        let retrainer = tokio::spawn(retrainer.run());

        info!(
            "⚙️ Engine up | model=v{} corpus={} skip={} strong={}",
            registry.get().version,
            corpus.len(),
            cfg.comparator.skip_threshold,
            cfg.comparator.strong_threshold,
        );
        Self {
            state: AppState { sessions, registry, retrain, corpus },
            broadcaster,
            collector,
            retrainer,
        }
    }

    /// End every session (one hand-off each), then let the collector drain.
    /// Clones of `AppState` held elsewhere must be dropped first or the
    /// collector is cut off after a timeout.
    pub async fn shutdown(self) -> Option<CollectorStats> {
        let Engine { state, broadcaster, collector, retrainer } = self;
        state.sessions.shutdown().await;
        drop(state);
        drop(broadcaster);

        let stats = match tokio::time::timeout(Duration::from_secs(5), collector).await {
            Ok(Ok(s)) => Some(s),
            Ok(Err(e)) => {
                warn!("collector task failed: {e}");
                None
            }
            Err(_) => {
                warn!("collector did not drain in time");
                None
            }
        };
        retrainer.abort();
        info!("⚙️ Engine stopped");
        stats
    }
}
