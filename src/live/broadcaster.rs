//! Snapshot fan-out.
//!
//! Each match has a bounded `broadcast` channel plus a "latest" slot; a
//! global topic carries every match. Publishing never waits on a
//! subscriber: a receiver that falls more than the buffer behind loses its
//! oldest entries and resumes from the newest retained ones. A new
//! subscriber starts from the latest snapshot only.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tracing::debug;

use super::messages::MatchSnapshot;
use super::types::MatchId;
use crate::config::env_parse;
use crate::error::ConfigError;

#[derive(Debug, Clone)]
pub struct BroadcasterConfig {
    /// Per-subscriber backlog before drop-oldest kicks in.
    pub subscriber_buffer: usize,
}

impl Default for BroadcasterConfig {
    fn default() -> Self {
        Self { subscriber_buffer: 64 }
    }
}

impl BroadcasterConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse("EDGE_SUBSCRIBER_BUFFER")? { c.subscriber_buffer = v; }
        if c.subscriber_buffer == 0 {
            return Err(ConfigError::invalid("EDGE_SUBSCRIBER_BUFFER", "must be at least 1"));
        }
        Ok(c)
    }
}

struct Topic {
    tx: broadcast::Sender<Arc<MatchSnapshot>>,
    latest: Option<Arc<MatchSnapshot>>,
}

struct Topics {
    per_match: HashMap<MatchId, Topic>,
    all: broadcast::Sender<Arc<MatchSnapshot>>,
}

pub struct Broadcaster {
    cfg: BroadcasterConfig,
    topics: Mutex<Topics>,
}

impl Broadcaster {
    pub fn new(cfg: BroadcasterConfig) -> Self {
        let cap = cfg.subscriber_buffer.max(1);
        let (all, _) = broadcast::channel(cap);
        Self {
            cfg,
            topics: Mutex::new(Topics { per_match: HashMap::new(), all }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Topics> {
        self.topics.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn topic<'a>(topics: &'a mut Topics, cap: usize, id: &MatchId) -> &'a mut Topic {
        topics.per_match.entry(id.clone()).or_insert_with(|| Topic {
            tx: broadcast::channel(cap).0,
            latest: None,
        })
    }

    /// Store as latest and fan out to the match topic and the global topic.
    pub fn publish(&self, snapshot: MatchSnapshot) -> Arc<MatchSnapshot> {
        let snap = Arc::new(snapshot);
        let cap = self.cfg.subscriber_buffer.max(1);
        let mut topics = self.lock();
        let topic = Self::topic(&mut topics, cap, &snap.match_id);
        topic.latest = Some(snap.clone());
        // no receivers is fine
        let _ = topic.tx.send(snap.clone());
        let _ = topics.all.send(snap.clone());
        snap
    }

    /// Latest snapshot first, then live ones. Subscribing before the first
    /// publish is allowed.
    pub fn subscribe(&self, match_id: &MatchId) -> Subscription {
        let cap = self.cfg.subscriber_buffer.max(1);
        let mut topics = self.lock();
        if !topics.per_match.contains_key(match_id) {
            // topics opened by subscribers that left before any publish
            topics.per_match.retain(|_, t| t.latest.is_some() || t.tx.receiver_count() > 0);
        }
        let topic = Self::topic(&mut topics, cap, match_id);
        Subscription {
            pending: topic.latest.iter().cloned().collect(),
            rx: topic.tx.subscribe(),
            skipped: 0,
        }
    }

    /// Latest snapshot of every known match, then every live publish.
    pub fn subscribe_all(&self) -> Subscription {
        let topics = self.lock();
        let mut pending: Vec<Arc<MatchSnapshot>> =
            topics.per_match.values().filter_map(|t| t.latest.clone()).collect();
        pending.sort_by(|a, b| a.match_id.cmp(&b.match_id));
        Subscription {
            pending: pending.into(),
            rx: topics.all.subscribe(),
            skipped: 0,
        }
    }

    /// Pull accessor.
    pub fn latest(&self, match_id: &MatchId) -> Option<Arc<MatchSnapshot>> {
        self.lock().per_match.get(match_id).and_then(|t| t.latest.clone())
    }

    pub fn latest_all(&self) -> Vec<Arc<MatchSnapshot>> {
        let mut out: Vec<_> = self.lock().per_match.values().filter_map(|t| t.latest.clone()).collect();
        out.sort_by(|a, b| a.match_id.cmp(&b.match_id));
        out
    }

    /// Drop a match topic. Its subscribers drain what they hold, then end.
    pub fn evict(&self, match_id: &MatchId) -> bool {
        let removed = self.lock().per_match.remove(match_id).is_some();
        if removed {
            debug!("📡 topic {match_id} evicted");
        }
        removed
    }

    pub fn topic_count(&self) -> usize {
        self.lock().per_match.len()
    }

    pub fn subscriber_count(&self, match_id: &MatchId) -> usize {
        self.lock()
            .per_match
            .get(match_id)
            .map(|t| t.tx.receiver_count())
            .unwrap_or(0)
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(BroadcasterConfig::default())
    }
}

pub struct Subscription {
    pending: VecDeque<Arc<MatchSnapshot>>,
    rx: broadcast::Receiver<Arc<MatchSnapshot>>,
    skipped: u64,
}

impl Subscription {
    /// Next snapshot, or `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<Arc<MatchSnapshot>> {
        if let Some(s) = self.pending.pop_front() {
            return Some(s);
        }
        loop {
            match self.rx.recv().await {
                Ok(s) => return Some(s),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.skipped += n;
                    debug!("📡 subscriber lagged, dropped {n} oldest");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Snapshots dropped because this subscriber fell behind.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn into_stream(self) -> impl futures::Stream<Item = Arc<MatchSnapshot>> {
        futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|s| (s, sub))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::types::{Lifecycle, MarketState, MatchMeta};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    fn snap(id: &str, seq: u64) -> MatchSnapshot {
        MatchSnapshot {
            match_id: MatchId::new(id),
            seq,
            lifecycle: Lifecycle::Live,
            meta: MatchMeta::default(),
            game_time: seq as f64,
            radiant_score: 0,
            dire_score: 0,
            gold_diff: 0.0,
            xp_diff: 0.0,
            features: None,
            prediction: None,
            market: MarketState::mock(),
            signal: None,
            winner: None,
            stale: false,
            inference_degraded: false,
            published_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reconnect_gets_latest_only() {
        let b = Broadcaster::default();
        for seq in 1..=10 {
            b.publish(snap("m1", seq));
        }
        let mut sub = b.subscribe(&MatchId::new("m1"));
        assert_eq!(sub.recv().await.unwrap().seq, 10);
        b.publish(snap("m1", 11));
        assert_eq!(sub.recv().await.unwrap().seq, 11);
        // nothing else queued
        assert!(timeout(Duration::from_millis(20), sub.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_without_blocking() {
        let b = Broadcaster::new(BroadcasterConfig { subscriber_buffer: 4 });
        let id = MatchId::new("m1");
        let mut slow = b.subscribe(&id);
        let mut fast = b.subscribe(&id);
        for seq in 1..=100 {
            b.publish(snap("m1", seq));
            assert_eq!(fast.recv().await.unwrap().seq, seq);
        }
        // slow one resumes at the oldest retained entry and ends on the latest
        let first = slow.recv().await.unwrap().seq;
        assert_eq!(first, 97);
        assert_eq!(slow.skipped(), 96);
        let mut last = first;
        while let Ok(Some(s)) = timeout(Duration::from_millis(20), slow.recv()).await {
            assert!(s.seq > last);
            last = s.seq;
        }
        assert_eq!(last, 100);
    }

    #[tokio::test]
    async fn test_global_topic_and_pull() {
        let b = Broadcaster::default();
        b.publish(snap("a", 1));
        b.publish(snap("b", 1));
        let mut all = b.subscribe_all();
        assert_eq!(all.recv().await.unwrap().match_id.as_str(), "a");
        assert_eq!(all.recv().await.unwrap().match_id.as_str(), "b");
        b.publish(snap("a", 2));
        assert_eq!(all.recv().await.unwrap().seq, 2);
        assert_eq!(b.latest(&MatchId::new("a")).unwrap().seq, 2);
        assert_eq!(b.latest_all().len(), 2);
    }

    #[tokio::test]
    async fn test_evict_ends_subscriptions() {
        let b = Broadcaster::default();
        let id = MatchId::new("m1");
        b.publish(snap("m1", 1));
        let mut sub = b.subscribe(&id);
        assert!(b.evict(&id));
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert!(sub.recv().await.is_none());
        assert!(b.latest(&id).is_none());
        assert!(!b.evict(&id));
    }

    #[test]
    fn test_abandoned_subscriptions_do_not_accumulate() {
        let b = Broadcaster::default();
        for i in 0..100 {
            let sub = b.subscribe(&MatchId::new(format!("ghost-{i}")));
            drop(sub);
        }
        assert_eq!(b.topic_count(), 1);

        // published and still-watched topics are kept
        b.publish(snap("real", 1));
        let held = b.subscribe(&MatchId::new("waiting"));
        b.subscribe(&MatchId::new("ghost-x"));
        assert!(b.latest(&MatchId::new("real")).is_some());
        assert_eq!(b.subscriber_count(&MatchId::new("waiting")), 1);
        assert_eq!(b.topic_count(), 3);
        drop(held);
    }
}
