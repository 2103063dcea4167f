//! Collector actor: ended sessions with a confirmed winner → training corpus.

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::corpus::{TrainingCorpus, TrainingExample};
use crate::live::messages::EndedSession;
use crate::live::types::Side;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CollectorStats {
    pub received: u64,
    pub appended: u64,
    pub duplicates: u64,
    pub no_outcome: u64,
    pub errors: u64,
}

pub struct Collector {
    corpus: TrainingCorpus,
    rx: mpsc::Receiver<EndedSession>,
    stats: CollectorStats,
}

impl Collector {
    pub fn new(corpus: TrainingCorpus, rx: mpsc::Receiver<EndedSession>) -> Self {
        Self { corpus, rx, stats: CollectorStats::default() }
    }

    /// Turn one hand-off into a corpus row. Sessions without a winner or
    /// without a single computed feature vector are skipped.
    pub fn example_for(ended: &EndedSession) -> Option<TrainingExample> {
        let winner = ended.winner?;
        let features = ended.features?;
        Some(TrainingExample {
            match_id: ended.match_id.clone(),
            features: features.to_vec(),
            radiant_win: winner == Side::Radiant,
            collected_at: ended.ended_at,
        })
    }

    fn handle(&mut self, ended: EndedSession) {
        self.stats.received += 1;
        let Some(example) = Self::example_for(&ended) else {
            self.stats.no_outcome += 1;
            debug!("collector: {} ended ({:?}) without outcome", ended.match_id, ended.reason);
            return;
        };
        match self.corpus.append(&example) {
            Ok(true) => {
                self.stats.appended += 1;
                info!(
                    "📥 Collected {} radiant_win={} corpus={}",
                    example.match_id,
                    example.radiant_win,
                    self.corpus.len(),
                );
            }
            Ok(false) => self.stats.duplicates += 1,
            Err(e) => {
                self.stats.errors += 1;
                warn!("collector: append for {} failed: {e}", example.match_id);
            }
        }
    }

    pub async fn run(mut self) -> CollectorStats {
        info!("📥 Collector started (corpus={})", self.corpus.len());
        while let Some(ended) = self.rx.recv().await {
            self.handle(ended);
        }
        let s = self.stats;
        info!(
            "📥 Collector shutdown | received={} appended={} dup={} no_outcome={} errors={}",
            s.received, s.appended, s.duplicates, s.no_outcome, s.errors,
        );
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::features::{EconomyHistory, FeatureExtractor, RawMatchState};
    use crate::live::messages::EndReason;
    use crate::live::types::{DraftContext, MatchId, RawTelemetry, TeamIdentity};
    use chrono::Utc;

    fn ended(id: &str, winner: Option<Side>) -> EndedSession {
        let fv = FeatureExtractor::default()
            .extract(RawMatchState {
                telemetry: &RawTelemetry::default(),
                history: &EconomyHistory::new(),
                draft: &DraftContext::default(),
                identity: &TeamIdentity::default(),
            })
            .unwrap();
        EndedSession {
            match_id: MatchId::new(id),
            reason: EndReason::Signal,
            winner,
            features: Some(fv),
            ended_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_collects_confirmed_outcomes_once() {
        let corpus = TrainingCorpus::in_memory();
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(Collector::new(corpus.clone(), rx).run());

        let win = ended("m1", Some(Side::Dire));
        // a resurrected session reports the same match with a later end time
        let again = EndedSession { ended_at: win.ended_at + chrono::Duration::seconds(30), ..win.clone() };
        tx.send(win).await.unwrap();
        tx.send(again).await.unwrap();
        tx.send(ended("m2", None)).await.unwrap();
        drop(tx);

        let stats = task.await.unwrap();
        assert_eq!(stats, CollectorStats { received: 3, appended: 1, duplicates: 1, no_outcome: 1, errors: 0 });
        let rows = corpus.load_all().unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].radiant_win);
        assert_eq!(rows[0].features.len(), crate::live::features::FEATURE_COUNT);
    }

    #[test]
    fn test_no_features_no_example() {
        let mut e = ended("m3", Some(Side::Radiant));
        e.features = None;
        assert!(Collector::example_for(&e).is_none());
    }
}
