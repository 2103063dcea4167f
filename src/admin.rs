//! HTTP surface: telemetry ingest, snapshot pull/stream, model operations.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::{RegistryError, TelemetryError};
use crate::live::messages::SessionInput;
use crate::live::types::{DraftContext, MarketState, MatchId, MatchMeta, RawTelemetry, Side, TeamIdentity};
use crate::model::registry::ModelSummary;
use crate::model::retrainer::RetrainOutcome;
use crate::AppState;

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/health", get(health))
        .route("/api/v1/gsi/:match_id", post(ingest_gsi))
        .route("/api/v1/matches", get(list_matches))
        .route("/api/v1/matches/:match_id", get(get_match))
        .route("/api/v1/matches/:match_id/stream", get(stream_match))
        .route("/api/v1/matches/:match_id/context", post(update_context))
        .route("/api/v1/matches/:match_id/end", post(end_match))
        .route("/api/v1/models", get(list_models))
        .route("/api/v1/models/retrain", post(retrain))
        .route("/api/v1/models/rollback", post(rollback))
        .with_state(state)
}

pub async fn serve_admin(
    state: AppState,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("🌐 Admin API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────

#[derive(Debug)]
enum ApiError {
    BadPayload(String),
    NotFound(String),
    Conflict(String),
    Unavailable(&'static str),
}

impl From<TelemetryError> for ApiError {
    fn from(e: TelemetryError) -> Self {
        ApiError::BadPayload(e.to_string())
    }
}

impl From<RegistryError> for ApiError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Store(inner) => {
                warn!("artifact store error: {inner}");
                ApiError::Unavailable("artifact store unavailable")
            }
            other => ApiError::Conflict(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match self {
            ApiError::BadPayload(m) => (StatusCode::BAD_REQUEST, m),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m),
            ApiError::Conflict(m) => (StatusCode::CONFLICT, m),
            ApiError::Unavailable(m) => (StatusCode::SERVICE_UNAVAILABLE, m.to_string()),
        };
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "live": state.sessions.live_count(),
        "sessions": state.sessions.session_count(),
        "topics": state.sessions.broadcaster().topic_count(),
        "model_version": state.registry.get().version,
        "corpus_rows": state.corpus.len(),
    }))
}

async fn ingest_gsi(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(body): Json<Value>,
) -> Result<StatusCode, ApiError> {
    let telemetry = RawTelemetry::from_json(&body).map_err(|e| {
        warn!("rejected telemetry for {match_id}: {e}");
        ApiError::from(e)
    })?;
    state.sessions.ingest(MatchId::new(match_id), SessionInput::Telemetry(telemetry)).await;
    Ok(StatusCode::ACCEPTED)
}

/// Slower-cadence collaborator inputs for one match. Every part is optional.
#[derive(Debug, Default, Deserialize)]
pub struct ContextBody {
    pub draft: Option<DraftContext>,
    pub identity: Option<TeamIdentity>,
    pub meta: Option<MatchMeta>,
    pub odds_radiant: Option<f64>,
    pub odds_dire: Option<f64>,
}

async fn update_context(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    Json(body): Json<ContextBody>,
) -> StatusCode {
    let id = MatchId::new(match_id);
    let mut inputs = Vec::new();
    if let Some(m) = body.meta {
        inputs.push(SessionInput::Meta(m));
    }
    if let Some(d) = body.draft {
        inputs.push(SessionInput::Draft(d));
    }
    if let Some(i) = body.identity {
        inputs.push(SessionInput::Identity(i));
    }
    if let (Some(r), Some(d)) = (body.odds_radiant, body.odds_dire) {
        inputs.push(SessionInput::Market(MarketState::from_decimal_odds(r, d)));
    }
    for input in inputs {
        state.sessions.ingest(id.clone(), input).await;
    }
    StatusCode::ACCEPTED
}

#[derive(Debug, Default, Deserialize)]
pub struct EndBody {
    /// "radiant" or "dire"; absent when the outcome is unknown.
    pub winner: Option<String>,
}

async fn end_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
    body: Option<Json<EndBody>>,
) -> Result<StatusCode, ApiError> {
    let winner = match body.and_then(|Json(b)| b.winner) {
        Some(w) => Some(Side::parse(&w).ok_or_else(|| ApiError::BadPayload(format!("unknown winner {w:?}")))?),
        None => None,
    };
    let id = MatchId::new(match_id);
    if state.sessions.end(&id, winner).await {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(ApiError::NotFound(format!("no session for {id}")))
    }
}

async fn get_match(State(state): State<AppState>, Path(match_id): Path<String>) -> Result<Response, ApiError> {
    let id = MatchId::new(match_id);
    match state.sessions.broadcaster().latest(&id) {
        Some(snap) => Ok(Json(&*snap).into_response()),
        None => Err(ApiError::NotFound(format!("no snapshot for {id}"))),
    }
}

async fn list_matches(State(state): State<AppState>) -> Response {
    let all = state.sessions.broadcaster().latest_all();
    let snaps: Vec<_> = all.iter().map(|s| &**s).collect();
    Json(snaps).into_response()
}

async fn stream_match(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let id = MatchId::new(match_id);
    let broadcaster = state.sessions.broadcaster();
    let sub = broadcaster.subscribe(&id);
    debug!("📡 SSE subscriber for {id} ({} watching)", broadcaster.subscriber_count(&id));
    let stream = sub.into_stream().filter_map(|snap| async move {
        match Event::default().event("snapshot").id(snap.seq.to_string()).json_data(&*snap) {
            Ok(ev) => Some(Ok(ev)),
            Err(e) => {
                warn!("snapshot for {} not serializable: {e}", snap.match_id);
                None
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

#[derive(Debug, Serialize)]
struct ModelsView {
    current: ModelSummary,
    history: Vec<ModelSummary>,
}

async fn list_models(State(state): State<AppState>) -> Json<ModelsView> {
    let view = ModelsView {
        current: ModelSummary::from(&*state.registry.get()),
        history: state.registry.history().iter().map(|a| ModelSummary::from(&**a)).collect(),
    };
    Json(view)
}

async fn retrain(State(state): State<AppState>) -> Result<Json<RetrainOutcome>, ApiError> {
    state
        .retrain
        .trigger()
        .await
        .map(Json)
        .ok_or(ApiError::Unavailable("retrainer stopped"))
}

#[derive(Debug, Default, Deserialize)]
pub struct RollbackBody {
    pub version: Option<u64>,
}

async fn rollback(
    State(state): State<AppState>,
    body: Option<Json<RollbackBody>>,
) -> Result<Json<ModelSummary>, ApiError> {
    let target = body.and_then(|Json(b)| b.version);
    let restored = state.registry.rollback(target).await?;
    Ok(Json(ModelSummary::from(&*restored)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::engine::Engine;
    use crate::live::messages::MatchSnapshot;
    use crate::model::artifact::ModelArtifact;
    use crate::model::corpus::TrainingCorpus;
    use crate::model::registry::{ModelRegistry, RegistryConfig};
    use std::sync::Arc;

    async fn spawn_api() -> (String, Engine) {
        let registry = Arc::new(ModelRegistry::new(RegistryConfig::default(), ModelArtifact::bootstrap()));
        let engine = Engine::start(&AppConfig::default(), registry, TrainingCorpus::in_memory());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(engine.state.clone());
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        (format!("http://{addr}/api/v1"), engine)
    }

    fn gsi(clock: f64, radiant_gold: f64) -> Value {
        json!({
            "map": {
                "clock_time": clock,
                "radiant_score": 20,
                "dire_score": 5,
                "radiant_gold": radiant_gold,
                "dire_gold": 30000.0,
            }
        })
    }

    async fn poll_snapshot(http: &reqwest::Client, base: &str, id: &str) -> MatchSnapshot {
        for _ in 0..50 {
            let resp = http.get(format!("{base}/matches/{id}")).send().await.unwrap();
            if resp.status() == reqwest::StatusCode::OK {
                return resp.json().await.unwrap();
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("no snapshot for {id}");
    }

    #[tokio::test]
    async fn test_ingest_then_pull() {
        let (base, _engine) = spawn_api().await;
        let http = reqwest::Client::new();
        let resp = http.post(format!("{base}/gsi/m1")).json(&gsi(1_500.0, 45_000.0)).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::ACCEPTED);

        let snap = poll_snapshot(&http, &base, "m1").await;
        assert_eq!(snap.game_time, 1_500.0);
        assert_eq!(snap.gold_diff, 15_000.0);
        assert!(snap.prediction.unwrap().calibrated > 0.5);

        let all: Vec<MatchSnapshot> = http.get(format!("{base}/matches")).send().await.unwrap().json().await.unwrap();
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_400() {
        let (base, _engine) = spawn_api().await;
        let http = reqwest::Client::new();
        let resp = http.post(format!("{base}/gsi/m1")).json(&json!([1, 2, 3])).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let resp = http.post(format!("{base}/gsi/m1")).json(&json!({"map": {"clock_time": "soon"}})).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::BAD_REQUEST);
        let resp = http.get(format!("{base}/matches/m1")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_end_unknown_match_is_404() {
        let (base, _engine) = spawn_api().await;
        let http = reqwest::Client::new();
        let resp = http.post(format!("{base}/matches/nope/end")).json(&json!({"winner": "radiant"})).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_models_and_rollback() {
        let (base, _engine) = spawn_api().await;
        let http = reqwest::Client::new();
        let v: Value = http.get(format!("{base}/models")).send().await.unwrap().json().await.unwrap();
        assert_eq!(v["current"]["version"], 0);
        assert_eq!(v["history"].as_array().unwrap().len(), 0);

        let resp = http.post(format!("{base}/models/rollback")).send().await.unwrap();
        assert_eq!(resp.status(), reqwest::StatusCode::CONFLICT);

        let out: Value = http.post(format!("{base}/models/retrain")).send().await.unwrap().json().await.unwrap();
        assert_eq!(out["outcome"], "skipped");
    }
}
