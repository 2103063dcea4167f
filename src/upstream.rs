//! Collaborator boundary: cached JSON over HTTP, plus the odds poller.
//!
//! Collaborators are treated as "return cached or fresh JSON". Transient
//! failures are retried with exponential backoff; once retries run out the
//! last good value is served if there is one.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::UpstreamError;
use crate::live::messages::SessionInput;
use crate::live::session::SessionStore;
use crate::live::types::MarketState;

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub cache_ttl: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub request_timeout: Duration,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(30),
            max_retries: 3,
            base_backoff: Duration::from_millis(200),
            request_timeout: Duration::from_secs(5),
        }
    }
}

struct CacheEntry {
    fetched: Instant,
    value: Value,
}

pub struct CachedJsonClient {
    client: reqwest::Client,
    base: Url,
    cfg: UpstreamConfig,
    cache: Mutex<HashMap<String, CacheEntry>>,
}

impl CachedJsonClient {
    pub fn new(base: Url, cfg: UpstreamConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(cfg.request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, base, cfg, cache: Mutex::new(HashMap::new()) }
    }

    fn cached(&self, key: &str, fresh_only: bool) -> Option<Value> {
        let cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
        cache
            .get(key)
            .filter(|e| !fresh_only || e.fetched.elapsed() < self.cfg.cache_ttl)
            .map(|e| e.value.clone())
    }

    /// GET `path` relative to the base URL.
    pub async fn get_json(&self, path: &str) -> Result<Value, UpstreamError> {
        let url = self.base.join(path)?;
        let key = url.to_string();
        if let Some(v) = self.cached(&key, true) {
            return Ok(v);
        }

        let mut attempt = 0;
        let err = loop {
            match self.fetch(&url).await {
                Ok(v) => {
                    let mut cache = self.cache.lock().unwrap_or_else(|p| p.into_inner());
                    cache.insert(key, CacheEntry { fetched: Instant::now(), value: v.clone() });
                    return Ok(v);
                }
                // 4xx will not get better by retrying
                Err(e @ UpstreamError::Status { status: 400..=499, .. }) => break e,
                Err(e) if attempt >= self.cfg.max_retries => break e,
                Err(e) => {
                    let backoff = self.cfg.base_backoff * 2u32.saturating_pow(attempt);
                    debug!("upstream {key} attempt {} failed ({e}), retrying in {:?}", attempt + 1, backoff);
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
            }
        };

        match self.cached(&key, false) {
            Some(stale) => {
                warn!("upstream {key} unavailable ({err}); serving last known value");
                Ok(stale)
            }
            None => Err(err),
        }
    }

    async fn fetch(&self, url: &Url) -> Result<Value, UpstreamError> {
        let resp = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|source| UpstreamError::Unreachable { url: url.to_string(), source })?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UpstreamError::Status { url: url.to_string(), status: status.as_u16() });
        }
        resp.json::<Value>()
            .await
            .map_err(|e| UpstreamError::Decode { url: url.to_string(), reason: e.to_string() })
    }
}

/// Odds payload → market state.
///
/// Accepts `{"odds_radiant": x, "odds_dire": y}` (also `radiant`/`dire`)
/// as decimal odds, or `{"is_mock": true}`. Anything unusable is the mock
/// market.
pub fn parse_odds(v: &Value) -> MarketState {
    if v.get("is_mock").and_then(Value::as_bool) == Some(true) {
        return MarketState::mock();
    }
    let pick = |a: &str, b: &str| v.get(a).or_else(|| v.get(b)).and_then(Value::as_f64);
    match (pick("odds_radiant", "radiant"), pick("odds_dire", "dire")) {
        (Some(r), Some(d)) => MarketState::from_decimal_odds(r, d),
        _ => MarketState::mock(),
    }
}

/// Polls the odds collaborator for every live session.
pub struct OddsPoller {
    client: CachedJsonClient,
    sessions: SessionStore,
    every: Duration,
    shutdown: watch::Receiver<bool>,
}

impl OddsPoller {
    pub fn new(
        client: CachedJsonClient,
        sessions: SessionStore,
        every: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { client, sessions, every, shutdown }
    }

    pub async fn run(mut self) {
        info!("💱 Odds poller every {:?} from {}", self.every, self.client.base);
        let mut ticker = interval(self.every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let (mut polls, mut failures) = (0u64, 0u64);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = self.shutdown.changed() => break,
            }
            for id in self.sessions.live_ids() {
                polls += 1;
                match self.client.get_json(&format!("odds/{id}")).await {
                    Ok(v) => self.sessions.ingest(id, SessionInput::Market(parse_odds(&v))).await,
                    Err(e) => {
                        failures += 1;
                        debug!("odds for {id} unavailable: {e}");
                    }
                }
            }
        }
        info!("💱 Odds poller shutdown | polls={polls} failures={failures}");
    }
}
