//! Channel message types between ingest, session owners, subscribers and the
//! collector.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::comparator::MispricingSignal;
use super::features::FeatureVector;
use super::types::{DraftContext, Lifecycle, MarketState, MatchId, MatchMeta, RawTelemetry, Side, TeamIdentity};
use crate::model::predictor::PredictionResult;

// ─────────────────────────────────────────────────────────
// Ingest → session owner
// ─────────────────────────────────────────────────────────

/// One update for a match. Sources refresh at different cadences, so each
/// kind replaces only its own slice of session state.
#[derive(Debug, Clone)]
pub enum SessionInput {
    Telemetry(RawTelemetry),
    Market(MarketState),
    Draft(DraftContext),
    Identity(TeamIdentity),
    Meta(MatchMeta),
    /// Explicit end-of-match signal, with the winner when it is known.
    End { winner: Option<Side> },
}

impl SessionInput {
    pub fn kind(&self) -> &'static str {
        match self {
            SessionInput::Telemetry(_) => "telemetry",
            SessionInput::Market(_) => "market",
            SessionInput::Draft(_) => "draft",
            SessionInput::Identity(_) => "identity",
            SessionInput::Meta(_) => "meta",
            SessionInput::End { .. } => "end",
        }
    }
}

// ─────────────────────────────────────────────────────────
// Session owner → subscribers
// ─────────────────────────────────────────────────────────

/// Immutable per-match state published after each pipeline pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchSnapshot {
    pub match_id: MatchId,
    /// Per-match publish sequence; strictly increasing.
    pub seq: u64,
    pub lifecycle: Lifecycle,
    pub meta: MatchMeta,
    pub game_time: f64,
    pub radiant_score: u32,
    pub dire_score: u32,
    pub gold_diff: f64,
    pub xp_diff: f64,
    pub features: Option<FeatureVector>,
    pub prediction: Option<PredictionResult>,
    pub market: MarketState,
    pub signal: Option<MispricingSignal>,
    pub winner: Option<Side>,
    /// No fresh telemetry for longer than the configured age.
    pub stale: bool,
    /// The latest inference failed; `prediction` is the last good one.
    pub inference_degraded: bool,
    pub published_at: DateTime<Utc>,
}

impl MatchSnapshot {
    pub fn model_version(&self) -> Option<u64> {
        self.prediction.map(|p| p.model_version)
    }
}

// ─────────────────────────────────────────────────────────
// Session owner → collector
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// End-of-match signal from a collaborator.
    Signal,
    /// Telemetry itself reported a winner.
    Decided,
    Inactivity,
    Shutdown,
}

/// Hand-off emitted exactly once when a session ends.
#[derive(Debug, Clone, PartialEq)]
pub struct EndedSession {
    pub match_id: MatchId,
    pub reason: EndReason,
    pub winner: Option<Side>,
    pub features: Option<FeatureVector>,
    pub ended_at: DateTime<Utc>,
}
