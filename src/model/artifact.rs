//! Immutable model artifacts: classifier + calibrator + provenance.
//!
//! Both blobs carry the artifact version so a reader can check that the pair
//! it holds came from one publish.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::calibration::{clamp_probability, IsotonicCurve};
use super::training::ValidationMetrics;
use crate::error::InferenceError;
use crate::live::features::FEATURE_COUNT;

/// Standardized logistic regression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    pub version: u64,
    pub weights: Vec<f64>,
    pub bias: f64,
    pub means: Vec<f64>,
    pub scales: Vec<f64>,
}

impl LogisticModel {
    pub fn margin(&self, x: &[f64]) -> f64 {
        x.iter()
            .zip(&self.weights)
            .zip(self.means.iter().zip(&self.scales))
            .fold(self.bias, |z, ((v, w), (mean, scale))| z + w * (v - mean) / scale)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ClassifierBlob {
    /// Fixed-weight fallback used before any model has been trained.
    Heuristic { version: u64 },
    Logistic(LogisticModel),
}

impl ClassifierBlob {
    pub fn version(&self) -> u64 {
        match self {
            ClassifierBlob::Heuristic { version } => *version,
            ClassifierBlob::Logistic(m) => m.version,
        }
    }

    pub fn input_dim(&self) -> usize {
        match self {
            ClassifierBlob::Heuristic { .. } => FEATURE_COUNT,
            ClassifierBlob::Logistic(m) => m.weights.len(),
        }
    }

    /// Raw radiant-win score in (0, 1).
    pub fn score(&self, x: &[f64]) -> Result<f64, InferenceError> {
        let expected = self.input_dim();
        if x.len() != expected {
            return Err(InferenceError::SchemaMismatch {
                version: self.version(),
                expected,
                got: x.len(),
            });
        }
        let p = match self {
            ClassifierBlob::Heuristic { .. } => heuristic(x),
            ClassifierBlob::Logistic(m) => sigmoid(m.margin(x)),
        };
        if p.is_finite() {
            Ok(p)
        } else {
            Err(InferenceError::NonFinite { version: self.version() })
        }
    }
}

/// Logistic over normalized gold/xp lead plus momentum, faded in over the
/// first twenty minutes.
fn heuristic(x: &[f64]) -> f64 {
    let game_time = x[0];
    let gold = x[3];
    let xp = x[5];
    let velocity = x[6];
    let combined = gold * 0.6 + xp * 0.4 + (velocity / 100.0) * 0.2;
    let base = sigmoid(3.0 * combined);
    let ramp = (game_time / 1_200.0).clamp(0.0, 1.0);
    (0.5 + (base - 0.5) * ramp).clamp(0.01, 0.99)
}

pub fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CalibratorBlob {
    Identity { version: u64 },
    Isotonic { version: u64, curve: IsotonicCurve },
}

impl CalibratorBlob {
    pub fn version(&self) -> u64 {
        match self {
            CalibratorBlob::Identity { version } | CalibratorBlob::Isotonic { version, .. } => {
                *version
            }
        }
    }

    pub fn map(&self, raw: f64) -> f64 {
        match self {
            CalibratorBlob::Identity { .. } => clamp_probability(raw),
            CalibratorBlob::Isotonic { curve, .. } => curve.calibrate(raw),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub version: u64,
    pub classifier: ClassifierBlob,
    pub calibrator: CalibratorBlob,
    pub trained_at: DateTime<Utc>,
    pub training_rows: usize,
    /// Held-out ROC AUC. `None` only for the bootstrap heuristic.
    pub validation_score: Option<f64>,
    #[serde(default)]
    pub metrics: Option<ValidationMetrics>,
}

impl ModelArtifact {
    /// Version 0: heuristic classifier with identity calibration.
    pub fn bootstrap() -> Self {
        Self {
            version: 0,
            classifier: ClassifierBlob::Heuristic { version: 0 },
            calibrator: CalibratorBlob::Identity { version: 0 },
            trained_at: Utc::now(),
            training_rows: 0,
            validation_score: None,
            metrics: None,
        }
    }

    pub fn input_dim(&self) -> usize {
        self.classifier.input_dim()
    }

    pub fn is_consistent(&self) -> bool {
        self.classifier.version() == self.version && self.calibrator.version() == self.version
    }

    /// Hex sha256 of the serialized classifier, recorded in the audit log.
    pub fn checksum(&self) -> String {
        let bytes = serde_json::to_vec(&self.classifier).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}
