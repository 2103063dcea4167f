//! Session store: one owner task per match id.
//!
//! ```text
//! ingest ──mpsc──► SessionActor(match) ──► extract → predict → compare
//!                        │                              │
//!                        │                              └──► Broadcaster
//!                        └── on end ──mpsc──► Collector
//! ```
//!
//! Lifecycle: CREATED on the first input, LIVE once a full feature vector
//! and a prediction exist, ENDED on an end signal, a decided game or
//! inactivity. An ended session keeps draining (and ignoring) input for the
//! grace period, then evicts itself from the store and the broadcaster.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use super::broadcaster::Broadcaster;
use super::comparator::MarketComparator;
use super::features::{EconomyHistory, FeatureExtractor, FeatureVector, RawMatchState};
use super::messages::{EndReason, EndedSession, MatchSnapshot, SessionInput};
use super::types::{DraftContext, Lifecycle, MarketState, MatchId, MatchMeta, RawTelemetry, Side, TeamIdentity};
use crate::config::env_parse;
use crate::error::ConfigError;
use crate::model::predictor::{PredictionResult, Predictor};

// ─────────────────────────────────────────────────────────
// Config
// ─────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// No input for this long → ENDED.
    pub inactivity_timeout: Duration,
    /// ENDED sessions linger this long before eviction.
    pub grace_period: Duration,
    /// Snapshots are re-published flagged stale after this long without telemetry.
    pub stale_after: Duration,
    /// Per-session inbox capacity.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(120),
            grace_period: Duration::from_secs(10),
            stale_after: Duration::from_secs(15),
            queue_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse("EDGE_INACTIVITY_TIMEOUT_MS")? { c.inactivity_timeout = Duration::from_millis(v); }
        if let Some(v) = env_parse("EDGE_GRACE_PERIOD_MS")? { c.grace_period = Duration::from_millis(v); }
        if let Some(v) = env_parse("EDGE_STALE_AFTER_MS")? { c.stale_after = Duration::from_millis(v); }
        if let Some(v) = env_parse("EDGE_SESSION_QUEUE")? { c.queue_capacity = v; }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("EDGE_SESSION_QUEUE", "must be at least 1"));
        }
        if self.inactivity_timeout.is_zero() {
            return Err(ConfigError::invalid("EDGE_INACTIVITY_TIMEOUT_MS", "must be > 0"));
        }
        Ok(())
    }
}

/// The synchronous, I/O-free part of a pass: extract → predict → compare.
pub struct Pipeline {
    pub extractor: FeatureExtractor,
    pub predictor: Predictor,
    pub comparator: MarketComparator,
}

// ─────────────────────────────────────────────────────────
// Store
// ─────────────────────────────────────────────────────────

struct SessionEntry {
    tx: mpsc::Sender<SessionInput>,
    generation: u64,
    lifecycle: watch::Receiver<Lifecycle>,
    handle: JoinHandle<()>,
}

struct Shared {
    cfg: SessionConfig,
    pipeline: Arc<Pipeline>,
    broadcaster: Arc<Broadcaster>,
    ended_tx: mpsc::Sender<EndedSession>,
    sessions: Mutex<HashMap<MatchId, SessionEntry>>,
    generation: AtomicU64,
    concluded: Mutex<Concluded>,
}

/// Recently decided match ids. Feeds keep posting the final state after a
/// game; those posts must not resurrect the match.
#[derive(Default)]
struct Concluded {
    order: VecDeque<MatchId>,
    ids: HashSet<MatchId>,
}

const CONCLUDED_MEMORY: usize = 4_096;

impl Concluded {
    fn record(&mut self, id: &MatchId) {
        if !self.ids.insert(id.clone()) {
            return;
        }
        self.order.push_back(id.clone());
        while self.order.len() > CONCLUDED_MEMORY {
            if let Some(old) = self.order.pop_front() {
                self.ids.remove(&old);
            }
        }
    }
}

impl Shared {
    fn sessions(&self) -> MutexGuard<'_, HashMap<MatchId, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn concluded(&self) -> MutexGuard<'_, Concluded> {
        self.concluded.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Remove `id` only if it is still the session that asked.
    fn evict(&self, id: &MatchId, generation: u64) {
        let mut map = self.sessions();
        if map.get(id).map(|e| e.generation) == Some(generation) {
            map.remove(id);
            drop(map);
            self.broadcaster.evict(id);
        }
    }
}

#[derive(Clone)]
pub struct SessionStore {
    shared: Arc<Shared>,
}

impl SessionStore {
    pub fn new(
        cfg: SessionConfig,
        pipeline: Arc<Pipeline>,
        broadcaster: Arc<Broadcaster>,
        ended_tx: mpsc::Sender<EndedSession>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                cfg,
                pipeline,
                broadcaster,
                ended_tx,
                sessions: Mutex::new(HashMap::new()),
                generation: AtomicU64::new(1),
                concluded: Mutex::new(Concluded::default()),
            }),
        }
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.shared.broadcaster
    }

    fn sender_for(&self, id: &MatchId) -> mpsc::Sender<SessionInput> {
        let mut map = self.shared.sessions();
        if let Some(e) = map.get(id) {
            return e.tx.clone();
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.shared.cfg.queue_capacity);
        let (life_tx, life_rx) = watch::channel(Lifecycle::Created);
        let actor = SessionActor::new(id.clone(), generation, self.shared.clone(), rx, life_tx);
        let handle = tokio::spawn(actor.run());
        map.insert(
            id.clone(),
            SessionEntry { tx: tx.clone(), generation, lifecycle: life_rx, handle },
        );
        tx
    }

    /// Route one input to the match owner, creating the session on first
    /// contact. Inputs for one match are applied in arrival order. Inputs for
    /// a match that already ended with a known winner are dropped.
    pub async fn ingest(&self, id: MatchId, input: SessionInput) {
        if self.is_concluded(&id) {
            debug!("session {id} already concluded, dropping {}", input.kind());
            return;
        }
        let tx = self.sender_for(&id);
        if let Err(mpsc::error::SendError(input)) = tx.send(input).await {
            // owner evicted itself between lookup and send
            let tx = self.sender_for(&id);
            if tx.send(input).await.is_err() {
                warn!("session {id} rejected input after restart");
            }
        }
    }

    /// Deliver an end signal to an existing session. Returns `false` when
    /// the match is unknown.
    pub async fn end(&self, id: &MatchId, winner: Option<Side>) -> bool {
        let tx = match self.shared.sessions().get(id) {
            Some(e) => e.tx.clone(),
            None => return false,
        };
        tx.send(SessionInput::End { winner }).await.is_ok()
    }

    pub fn is_concluded(&self, id: &MatchId) -> bool {
        self.shared.concluded().ids.contains(id)
    }

    pub fn lifecycle(&self, id: &MatchId) -> Option<Lifecycle> {
        self.shared.sessions().get(id).map(|e| *e.lifecycle.borrow())
    }

    pub fn live_ids(&self) -> Vec<MatchId> {
        self.shared
            .sessions()
            .iter()
            .filter(|(_, e)| *e.lifecycle.borrow() == Lifecycle::Live)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn live_count(&self) -> usize {
        self.live_ids().len()
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions().len()
    }

    /// Close every inbox and wait for the owners to finish their hand-off.
    pub async fn shutdown(&self) {
        let entries: Vec<(MatchId, SessionEntry)> = self.shared.sessions().drain().collect();
        info!("🛑 Session store shutting down {} sessions", entries.len());
        for (id, entry) in entries {
            drop(entry.tx);
            if let Err(e) = entry.handle.await {
                warn!("session {id} task failed: {e}");
            }
        }
    }
}

// ─────────────────────────────────────────────────────────
// Actor
// ─────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Stats {
    inputs: u64,
    passes: u64,
    coalesced: u64,
    malformed: u64,
    inference_failures: u64,
}

struct SessionActor {
    id: MatchId,
    generation: u64,
    shared: Arc<Shared>,
    rx: mpsc::Receiver<SessionInput>,
    lifecycle_tx: watch::Sender<Lifecycle>,

    telemetry: Option<RawTelemetry>,
    history: EconomyHistory,
    draft: DraftContext,
    identity: TeamIdentity,
    market: MarketState,
    meta: MatchMeta,

    last_features: Option<FeatureVector>,
    last_prediction: Option<PredictionResult>,
    degraded: bool,
    stale_published: bool,
    seq: u64,
    last_telemetry: Instant,
    stats: Stats,
}

enum Wake {
    Inputs(Vec<SessionInput>),
    Closed,
    Inactive,
    Stale,
}

impl SessionActor {
    fn new(
        id: MatchId,
        generation: u64,
        shared: Arc<Shared>,
        rx: mpsc::Receiver<SessionInput>,
        lifecycle_tx: watch::Sender<Lifecycle>,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            generation,
            shared,
            rx,
            lifecycle_tx,
            telemetry: None,
            history: EconomyHistory::new(),
            draft: DraftContext::default(),
            identity: TeamIdentity::default(),
            market: MarketState::mock(),
            meta: MatchMeta::default(),
            last_features: None,
            last_prediction: None,
            degraded: false,
            stale_published: false,
            seq: 0,
            last_telemetry: now,
            stats: Stats::default(),
        }
    }

    fn lifecycle(&self) -> Lifecycle {
        *self.lifecycle_tx.borrow()
    }

    async fn run(mut self) {
        debug!("🎮 Session {} created (gen {})", self.id, self.generation);

        let end = loop {
            match self.wait().await {
                Wake::Inputs(batch) => {
                    if let Some(end) = self.apply(batch) {
                        break end;
                    }
                }
                Wake::Stale => self.publish_stale(),
                Wake::Inactive => break (EndReason::Inactivity, None),
                Wake::Closed => break (EndReason::Shutdown, None),
            }
        };

        self.finish(end.0, end.1).await;
        if end.0 != EndReason::Shutdown {
            self.linger().await;
            self.shared.evict(&self.id, self.generation);
        }

        info!(
            "🏁 Session {} done | reason={:?} inputs={} passes={} coalesced={} malformed={} inference_failures={}",
            self.id, end.0, self.stats.inputs, self.stats.passes, self.stats.coalesced,
            self.stats.malformed, self.stats.inference_failures,
        );
    }

    /// Block for the next batch of inputs or a timer.
    async fn wait(&mut self) -> Wake {
        let cfg = &self.shared.cfg;
        // only telemetry counts as activity; odds and context keep flowing after a feed dies
        let inactive_at = self.last_telemetry + cfg.inactivity_timeout;
        let stale_at = self.last_telemetry + cfg.stale_after;
        let watch_stale = self.telemetry.is_some() && !self.stale_published;

        tokio::select! {
            msg = self.rx.recv() => match msg {
                Some(first) => {
                    let mut batch = vec![first];
                    while let Ok(more) = self.rx.try_recv() {
                        batch.push(more);
                    }
                    Wake::Inputs(batch)
                }
                None => Wake::Closed,
            },
            _ = sleep_until(inactive_at) => Wake::Inactive,
            _ = sleep_until(stale_at), if watch_stale => Wake::Stale,
        }
    }

    /// Fold a batch in arrival order and run at most one pipeline pass.
    /// Returns the end reason if the batch ended the session.
    fn apply(&mut self, batch: Vec<SessionInput>) -> Option<(EndReason, Option<Side>)> {
        let now = Instant::now();
        self.stats.inputs += batch.len() as u64;
        let mut ticks = 0u64;
        let mut end = None;

        for input in batch {
            match input {
                SessionInput::Telemetry(t) => {
                    let gold_diff = t.radiant_net_worth - t.dire_net_worth;
                    self.history.record(t.elapsed_secs, gold_diff);
                    if let Some(w) = t.winner {
                        end = Some((EndReason::Decided, Some(w)));
                    }
                    self.telemetry = Some(t);
                    self.last_telemetry = now;
                    self.stale_published = false;
                    ticks += 1;
                }
                SessionInput::Market(m) => self.market = m,
                SessionInput::Draft(d) => self.draft = d,
                SessionInput::Identity(i) => self.identity = i,
                SessionInput::Meta(m) => self.meta = m,
                SessionInput::End { winner } => {
                    end = Some((EndReason::Signal, winner));
                }
            }
            if end.is_some() {
                // anything queued behind the end is dropped
                break;
            }
        }
        self.stats.coalesced += ticks.saturating_sub(1);
        let horizon = (self.shared.pipeline.extractor.config().velocity_window_secs * 2.0).max(120.0);
        self.history.prune(horizon);

        self.pass();
        end
    }

    fn pass(&mut self) {
        let Some(telemetry) = &self.telemetry else {
            return;
        };
        let pipeline = &self.shared.pipeline;
        let raw = RawMatchState {
            telemetry,
            history: &self.history,
            draft: &self.draft,
            identity: &self.identity,
        };
        match pipeline.extractor.extract(raw) {
            Ok(fv) => self.last_features = Some(fv),
            Err(e) => {
                self.stats.malformed += 1;
                warn!("session {} dropped malformed tick: {e}", self.id);
                return;
            }
        }
        self.stats.passes += 1;

        if let Some(fv) = &self.last_features {
            match pipeline.predictor.predict(fv.as_slice()) {
                Ok(p) => {
                    self.last_prediction = Some(p);
                    self.degraded = false;
                }
                Err(e) => {
                    self.stats.inference_failures += 1;
                    self.degraded = true;
                    debug!("session {} keeps last prediction: {e}", self.id);
                }
            }
        }

        if self.lifecycle() == Lifecycle::Created && self.last_prediction.is_some() {
            self.lifecycle_tx.send_replace(Lifecycle::Live);
            info!("🎮 Session {} LIVE", self.id);
        }
        self.publish(None);
    }

    /// Stale is a property of the telemetry age, whatever triggered the pass.
    fn publish(&mut self, winner: Option<Side>) {
        let Some(t) = &self.telemetry else {
            return;
        };
        let stale = self.last_telemetry.elapsed() >= self.shared.cfg.stale_after;
        let signal = self
            .last_prediction
            .map(|p| self.shared.pipeline.comparator.compare(p.calibrated, &self.market));
        self.seq += 1;
        let snapshot = MatchSnapshot {
            match_id: self.id.clone(),
            seq: self.seq,
            lifecycle: self.lifecycle(),
            meta: self.meta.clone(),
            game_time: t.elapsed_secs,
            radiant_score: t.radiant_score,
            dire_score: t.dire_score,
            gold_diff: t.radiant_net_worth - t.dire_net_worth,
            xp_diff: t.radiant_xp - t.dire_xp,
            features: self.last_features,
            prediction: self.last_prediction,
            market: self.market,
            signal,
            winner,
            stale,
            inference_degraded: self.degraded,
            published_at: Utc::now(),
        };
        self.shared.broadcaster.publish(snapshot);
    }

    fn publish_stale(&mut self) {
        self.stale_published = true;
        debug!("session {} stale", self.id);
        self.publish(None);
    }

    /// ENDED: final snapshot plus exactly one collector hand-off.
    async fn finish(&mut self, reason: EndReason, winner: Option<Side>) {
        self.lifecycle_tx.send_replace(Lifecycle::Ended);
        if winner.is_some() {
            self.shared.concluded().record(&self.id);
        }
        self.publish(winner);
        info!("🏁 Session {} ENDED ({:?}) winner={:?}", self.id, reason, winner.map(|w| w.as_str()));

        let handoff = EndedSession {
            match_id: self.id.clone(),
            reason,
            winner,
            features: self.last_features,
            ended_at: Utc::now(),
        };
        if self.shared.ended_tx.send(handoff).await.is_err() {
            warn!("collector gone; session {} outcome not recorded", self.id);
        }
    }

    /// Keep the inbox drained during the grace period so senders never block.
    async fn linger(&mut self) {
        let deadline = Instant::now() + self.shared.cfg.grace_period;
        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(input) => debug!("session {} ended, ignoring {}", self.id, input.kind()),
                    None => return,
                },
                _ = sleep_until(deadline) => return,
            }
        }
    }
}
