//! Live esports win-probability service.
//!
//! Telemetry ticks flow through a per-match session owner:
//! features → calibrated prediction → market comparison → broadcast.
//! Finished matches feed a training corpus; a retrainer publishes new model
//! artifacts into a registry that the serving path reads without locking
//! out publishers.

pub mod admin;
pub mod config;
pub mod engine;
pub mod error;
pub mod live;
pub mod model;
pub mod upstream;

use std::sync::Arc;

use live::session::SessionStore;
use model::corpus::TrainingCorpus;
use model::registry::ModelRegistry;
use model::retrainer::RetrainHandle;

// --- Shared App State (admin API) ---
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionStore,
    pub registry: Arc<ModelRegistry>,
    pub retrain: RetrainHandle,
    pub corpus: TrainingCorpus,
}
