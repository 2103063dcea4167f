//! Error taxonomy shared by the live pipeline, the model layer and the
//! collaborator boundary.

use thiserror::Error;

/// Telemetry payload that cannot be turned into a typed record at all.
/// Missing fields are never an error; they map to feature defaults.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum TelemetryError {
    #[error("telemetry payload is not a JSON object")]
    NotAnObject,
    #[error("field `{field}` has the wrong shape: {reason}")]
    BadField { field: &'static str, reason: String },
    #[error("clock value {0} is negative or non-finite")]
    BadClock(f64),
}

/// Upstream collaborator (telemetry, odds, draft) unreachable or slow.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream request to {url} failed: {source}")]
    Unreachable {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("upstream {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("upstream payload from {url} could not be decoded: {reason}")]
    Decode { url: String, reason: String },
    #[error("invalid upstream url: {0}")]
    BadUrl(#[from] url::ParseError),
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InferenceError {
    #[error("feature vector has {got} values, model v{version} expects {expected}")]
    SchemaMismatch {
        version: u64,
        expected: usize,
        got: usize,
    },
    #[error("model v{version} produced a non-finite score")]
    NonFinite { version: u64 },
}

impl InferenceError {
    pub fn is_schema_mismatch(&self) -> bool {
        matches!(self, InferenceError::SchemaMismatch { .. })
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(
        "candidate v{version} rejected: score {candidate:.4} regresses past {current:.4} - {tolerance}"
    )]
    ValidationRejected {
        version: u64,
        candidate: f64,
        current: f64,
        tolerance: f64,
    },
    #[error("candidate v{0} carries no validation score")]
    Unscored(u64),
    #[error("model version {0} is not in the rollback history")]
    UnknownVersion(u64),
    #[error("no previous model to roll back to")]
    NothingToRollBack,
    #[error("artifact store: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum CorpusError {
    #[error("io error on corpus {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corpus line {line} is corrupt: {source}")]
    Corrupt {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum TrainingError {
    #[error("only {rows} training rows, need at least {min}")]
    InsufficientData { rows: usize, min: usize },
    #[error("training split contains a single outcome class")]
    SingleClass,
    #[error("training rows have inconsistent widths ({0} vs {1})")]
    RaggedRows(usize, usize),
    #[error("corpus: {0}")]
    Corpus(#[from] CorpusError),
}

/// Malformed configuration. The service refuses to start.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    #[error("config `{key}` is invalid: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl ConfigError {
    pub fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            key,
            reason: reason.into(),
        }
    }
}
