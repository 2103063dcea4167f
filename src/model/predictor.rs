//! Feature vector + current artifact → calibrated probability.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::artifact::ModelArtifact;
use super::registry::ModelRegistry;
use crate::error::InferenceError;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionResult {
    pub raw: f64,
    pub calibrated: f64,
    pub model_version: u64,
    pub computed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct Predictor {
    registry: Arc<ModelRegistry>,
}

impl Predictor {
    pub fn new(registry: Arc<ModelRegistry>) -> Self {
        Self { registry }
    }

    /// Score against the current artifact. A schema mismatch is retried
    /// exactly once against whatever artifact is current at that point;
    /// the outcome of the final attempt is reported to the registry.
    pub fn predict(&self, features: &[f64]) -> Result<PredictionResult, InferenceError> {
        let model = self.registry.get();
        let (model, result) = match score(&model, features) {
            Err(e) if e.is_schema_mismatch() => {
                let latest = self.registry.get();
                debug!("schema mismatch on v{} ({e}), retrying on v{}", model.version, latest.version);
                let retry = score(&latest, features);
                (latest, retry)
            }
            other => (model, other),
        };
        match &result {
            Ok(_) => self.registry.report_success(model.version),
            Err(e) => {
                warn!("inference failed on v{}: {e}", model.version);
                self.registry.report_failure(model.version);
            }
        }
        result
    }
}

/// Pure scoring against one artifact. The artifact stays alive for the
/// whole call even if the registry moves on.
pub fn score(model: &ModelArtifact, features: &[f64]) -> Result<PredictionResult, InferenceError> {
    let raw = model.classifier.score(features)?;
    Ok(PredictionResult {
        raw,
        calibrated: model.calibrator.map(raw),
        model_version: model.version,
        computed_at: Utc::now(),
    })
}
