//! Retrainer actor: corpus → candidate → validation → publish.
//!
//! Runs on a fixed interval and on manual triggers. Cycles never overlap;
//! triggers that arrive while a cycle is running are answered with the
//! outcome of the next cycle rather than starting one each. The only
//! contact with the serving path is `ModelRegistry::publish`.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use super::corpus::TrainingCorpus;
use super::registry::ModelRegistry;
use super::training::{build_candidate, ClassifierTrainer, SplitConfig};
use crate::config::env_parse;
use crate::error::{ConfigError, RegistryError, TrainingError};

#[derive(Debug, Clone)]
pub struct RetrainConfig {
    pub interval: Duration,
    pub split: SplitConfig,
}

impl Default for RetrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(86_400),
            split: SplitConfig::default(),
        }
    }
}

impl RetrainConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse("EDGE_RETRAIN_INTERVAL_SECS")? { c.interval = Duration::from_secs(v); }
        if let Some(v) = env_parse("EDGE_MIN_TRAINING_ROWS")? { c.split.min_rows = v; }
        if let Some(v) = env_parse("EDGE_HOLDOUT_FRACTION")? { c.split.holdout_fraction = v; }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let f = self.split.holdout_fraction;
        if !(f > 0.0 && f < 1.0) {
            return Err(ConfigError::invalid("EDGE_HOLDOUT_FRACTION", format!("{f} must be in (0, 1)")));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::invalid("EDGE_RETRAIN_INTERVAL_SECS", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetrainOutcome {
    Published { version: u64, score: f64 },
    Rejected { version: u64, score: f64, current: f64 },
    Skipped { rows: usize, min: usize },
    Failed { reason: String },
}

type Reply = oneshot::Sender<RetrainOutcome>;

/// Manual trigger for the retrainer.
#[derive(Clone)]
pub struct RetrainHandle {
    tx: mpsc::Sender<Reply>,
}

impl RetrainHandle {
    /// Run (or join) a cycle and wait for its outcome. `None` if the
    /// retrainer has stopped.
    pub async fn trigger(&self) -> Option<RetrainOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx.send(reply).await.ok()?;
        rx.await.ok()
    }
}

pub struct Retrainer {
    cfg: RetrainConfig,
    corpus: TrainingCorpus,
    registry: Arc<ModelRegistry>,
    trainer: Arc<dyn ClassifierTrainer>,
    rx: mpsc::Receiver<Reply>,
    cycles: u64,
}

impl Retrainer {
    pub fn new(
        cfg: RetrainConfig,
        corpus: TrainingCorpus,
        registry: Arc<ModelRegistry>,
        trainer: Arc<dyn ClassifierTrainer>,
    ) -> (Self, RetrainHandle) {
        let (tx, rx) = mpsc::channel(16);
        let r = Self { cfg, corpus, registry, trainer, rx, cycles: 0 };
        (r, RetrainHandle { tx })
    }

    pub async fn run(mut self) {
        info!(
            "🧠 Retrainer [{}] interval={}s min_rows={} holdout={:.2}",
            self.trainer.name(),
            self.cfg.interval.as_secs(),
            self.cfg.split.min_rows,
            self.cfg.split.holdout_fraction,
        );
        let mut ticker = interval_at(Instant::now() + self.cfg.interval, self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                reply = self.rx.recv() => {
                    let Some(first) = reply else { break };
                    let outcome = self.cycle().await;
                    let _ = first.send(outcome.clone());
                    // triggers queued during the cycle share its result
                    while let Ok(r) = self.rx.try_recv() {
                        let _ = r.send(outcome.clone());
                    }
                }
            }
        }
        info!("🧠 Retrainer shutdown | cycles={}", self.cycles);
    }

    /// One full cycle. Never touches the current artifact unless the
    /// candidate passes the registry's acceptance rule.
    pub async fn cycle(&mut self) -> RetrainOutcome {
        self.cycles += 1;
        let rows = self.corpus.len();
        let min = self.cfg.split.min_rows;
        if rows < min {
            info!("🧠 Retrain skipped: {rows} rows < {min}");
            return RetrainOutcome::Skipped { rows, min };
        }

        let version = self.registry.next_version();
        let corpus = self.corpus.clone();
        let trainer = self.trainer.clone();
        let split = self.cfg.split.clone();
        let started = std::time::Instant::now();
        let built = tokio::task::spawn_blocking(move || {
            let examples = corpus.load_all().map_err(TrainingError::from)?;
            build_candidate(trainer.as_ref(), &examples, &split, version)
        })
        .await;

        let candidate = match built {
            Ok(Ok(c)) => c,
            Ok(Err(TrainingError::InsufficientData { rows, min })) => {
                info!("🧠 Retrain skipped: {rows} rows < {min}");
                return RetrainOutcome::Skipped { rows, min };
            }
            Ok(Err(e)) => {
                warn!("🧠 Retrain v{version} failed: {e}");
                return RetrainOutcome::Failed { reason: e.to_string() };
            }
            Err(e) => {
                error!("🧠 Retrain v{version} task panicked: {e}");
                return RetrainOutcome::Failed { reason: e.to_string() };
            }
        };
        let score = candidate.validation_score.unwrap_or(0.0);
        info!(
            "🧠 Candidate v{version} trained in {:?}: rows={} auc={:.4} metrics={:?}",
            started.elapsed(),
            candidate.training_rows,
            score,
            candidate.metrics,
        );

        match self.registry.publish(candidate).await {
            Ok(a) => RetrainOutcome::Published { version: a.version, score },
            Err(RegistryError::ValidationRejected { current, .. }) => {
                RetrainOutcome::Rejected { version, score, current }
            }
            Err(e) => {
                error!("🧠 Publish of v{version} failed: {e}");
                RetrainOutcome::Failed { reason: e.to_string() }
            }
        }
    }
}
