//! Model registry: the single cross-task mutable resource of the serving path.
//!
//! The current artifact is an immutable `Arc<ModelArtifact>` held in a
//! `watch` channel. Readers clone the `Arc` and keep using it for as long as
//! they like; a publish replaces the pointer, never the artifact, so a reader
//! can never see a classifier and a calibrator from different versions.
//!
//! Writers:
//! - `publish` / `rollback` are serialized by an async mutex.
//! - Auto-revert runs from `report_failure` on the serving path. It only
//!   touches the swap state under a short std mutex, which `publish` also
//!   holds while swapping.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::artifact::ModelArtifact;
use super::store::{ArtifactStore, AuditAction, AuditRecord};
use crate::config::env_parse;
use crate::error::{ConfigError, RegistryError};

#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Allowed validation-score regression versus the current artifact.
    pub tolerance: f64,
    /// Previous artifacts kept for rollback.
    pub history_len: usize,
    /// Post-publish window during which inference failures are counted.
    pub observation_window: Duration,
    /// Failures tolerated inside the window before reverting.
    pub retry_budget: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            tolerance: 0.005,
            history_len: 5,
            observation_window: Duration::from_secs(60),
            retry_budget: 3,
        }
    }
}

impl RegistryConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse("EDGE_PUBLISH_TOLERANCE")? { c.tolerance = v; }
        if let Some(v) = env_parse("EDGE_HISTORY_LEN")? { c.history_len = v; }
        if let Some(v) = env_parse("EDGE_OBSERVATION_WINDOW_MS")? { c.observation_window = Duration::from_millis(v); }
        if let Some(v) = env_parse("EDGE_RETRY_BUDGET")? { c.retry_budget = v; }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(ConfigError::invalid("EDGE_PUBLISH_TOLERANCE", "must be a finite value >= 0"));
        }
        if self.history_len == 0 {
            return Err(ConfigError::invalid("EDGE_HISTORY_LEN", "must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AlertKind {
    AutoReverted { from: u64, to: u64, failures: u32 },
    PublishRejected { version: u64, candidate: f64, current: f64 },
}

/// Operator-visible event.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegistryAlert {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: AlertKind,
}

#[derive(Debug)]
struct Observation {
    version: u64,
    started: Instant,
    failures: u32,
}

#[derive(Debug, Default)]
struct SwapState {
    /// Oldest first.
    history: VecDeque<Arc<ModelArtifact>>,
    observation: Option<Observation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelSummary {
    pub version: u64,
    pub trained_at: DateTime<Utc>,
    pub training_rows: usize,
    pub validation_score: Option<f64>,
}

impl From<&ModelArtifact> for ModelSummary {
    fn from(a: &ModelArtifact) -> Self {
        Self {
            version: a.version,
            trained_at: a.trained_at,
            training_rows: a.training_rows,
            validation_score: a.validation_score,
        }
    }
}

pub struct ModelRegistry {
    cfg: RegistryConfig,
    current: watch::Sender<Arc<ModelArtifact>>,
    state: Mutex<SwapState>,
    publish_lock: tokio::sync::Mutex<()>,
    alerts: watch::Sender<Option<RegistryAlert>>,
    next_version: AtomicU64,
    store: Option<ArtifactStore>,
}

impl ModelRegistry {
    /// In-memory registry seeded with `initial`.
    pub fn new(cfg: RegistryConfig, initial: ModelArtifact) -> Self {
        let next = initial.version + 1;
        Self {
            cfg,
            current: watch::Sender::new(Arc::new(initial)),
            state: Mutex::new(SwapState::default()),
            publish_lock: tokio::sync::Mutex::new(()),
            alerts: watch::Sender::new(None),
            next_version: AtomicU64::new(next),
            store: None,
        }
    }

    /// Restore the current artifact and rollback history from `store`, or
    /// start from the bootstrap heuristic when the store is empty.
    pub fn open(cfg: RegistryConfig, store: ArtifactStore) -> Result<Self, RegistryError> {
        let versions = store.versions()?;
        let current = match store.current_version()? {
            Some(v) => store.load(v)?,
            None => None,
        };
        let mut history = VecDeque::new();
        let initial = match current {
            Some(cur) => {
                let older: Vec<u64> = versions.iter().copied().filter(|v| *v < cur.version).collect();
                let skip = older.len().saturating_sub(cfg.history_len);
                for v in &older[skip..] {
                    if let Some(a) = store.load(*v)? {
                        history.push_back(Arc::new(a));
                    }
                }
                cur
            }
            None => ModelArtifact::bootstrap(),
        };
        // pruned or rejected versions still appear in the audit log and are never reused
        let audited = store.audit_log()?.iter().map(|r| r.version).max().unwrap_or(0);
        let next = versions.last().copied().unwrap_or(0).max(initial.version).max(audited) + 1;
        info!(
            "📦 Registry restored v{} (score={:?}) history={} next=v{} from {}",
            initial.version,
            initial.validation_score,
            history.len(),
            next,
            store.root().display(),
        );
        let reg = Self::new(cfg, initial);
        reg.next_version.store(next, Ordering::SeqCst);
        reg.lock_state().history = history;
        Ok(Self { store: Some(store), ..reg })
    }

    fn lock_state(&self) -> MutexGuard<'_, SwapState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Current artifact. Never waits on a publish.
    pub fn get(&self) -> Arc<ModelArtifact> {
        self.current.borrow().clone()
    }

    pub fn subscribe_alerts(&self) -> watch::Receiver<Option<RegistryAlert>> {
        self.alerts.subscribe()
    }

    /// Reserve a version id for a candidate.
    pub fn next_version(&self) -> u64 {
        self.next_version.fetch_add(1, Ordering::SeqCst)
    }

    /// Rollback candidates, oldest first.
    pub fn history(&self) -> Vec<Arc<ModelArtifact>> {
        self.lock_state().history.iter().cloned().collect()
    }

    /// Publish `candidate` if its validation score does not regress past the
    /// configured tolerance.
    pub async fn publish(&self, candidate: ModelArtifact) -> Result<Arc<ModelArtifact>, RegistryError> {
        let _guard = self.publish_lock.lock().await;
        let score = candidate.validation_score.ok_or(RegistryError::Unscored(candidate.version))?;
        let current = self.get();

        if let Some(cur_score) = current.validation_score {
            if score < cur_score - self.cfg.tolerance {
                warn!(
                    "🚫 Candidate v{} rejected: score {:.4} < current v{} {:.4} - tol {}",
                    candidate.version, score, current.version, cur_score, self.cfg.tolerance,
                );
                self.audit(
                    AuditRecord::new(AuditAction::Rejected, &candidate, Some(current.version))
                        .with_reason(format!("score {score:.4} vs {cur_score:.4}")),
                );
                self.alert(AlertKind::PublishRejected {
                    version: candidate.version,
                    candidate: score,
                    current: cur_score,
                });
                return Err(RegistryError::ValidationRejected {
                    version: candidate.version,
                    candidate: score,
                    current: cur_score,
                    tolerance: self.cfg.tolerance,
                });
            }
        }

        if let Some(store) = &self.store {
            store.save(&candidate)?;
            store.set_current(candidate.version)?;
            store.audit(&AuditRecord::new(AuditAction::Published, &candidate, Some(current.version)))?;
        }
        self.next_version.fetch_max(candidate.version + 1, Ordering::SeqCst);

        let next = Arc::new(candidate);
        let keep: Vec<u64> = {
            let mut st = self.lock_state();
            let prev = self.current.send_replace(next.clone());
            st.history.push_back(prev);
            while st.history.len() > self.cfg.history_len {
                st.history.pop_front();
            }
            st.observation = Some(Observation {
                version: next.version,
                started: Instant::now(),
                failures: 0,
            });
            st.history.iter().map(|a| a.version).chain([next.version]).collect()
        };
        if let Some(store) = &self.store {
            match store.prune(&keep) {
                Ok(removed) if !removed.is_empty() => debug!("📦 pruned artifacts {removed:?}"),
                Ok(_) => {}
                Err(e) => warn!("artifact prune failed: {e}"),
            }
        }
        info!(
            "📦 Published v{} score={:.4} rows={} (was v{})",
            next.version, score, next.training_rows, current.version,
        );
        Ok(next)
    }

    /// Manually restore `target` (or the most recent previous artifact).
    /// Artifacts newer than the target are dropped from the history.
    pub async fn rollback(&self, target: Option<u64>) -> Result<Arc<ModelArtifact>, RegistryError> {
        let _guard = self.publish_lock.lock().await;
        let (restored, replaced) = {
            let mut st = self.lock_state();
            let idx = match target {
                None => st.history.len().checked_sub(1).ok_or(RegistryError::NothingToRollBack)?,
                Some(v) => st
                    .history
                    .iter()
                    .position(|a| a.version == v)
                    .ok_or(RegistryError::UnknownVersion(v))?,
            };
            let restored = st.history[idx].clone();
            st.history.truncate(idx);
            st.observation = None;
            let replaced = self.current.send_replace(restored.clone());
            (restored, replaced)
        };
        warn!("⏪ Rolled back v{} → v{}", replaced.version, restored.version);
        if let Some(store) = &self.store {
            store.set_current(restored.version)?;
            store.audit(&AuditRecord::new(AuditAction::RolledBack, &restored, Some(replaced.version)))?;
        }
        Ok(restored)
    }

    /// Inference against `version` succeeded. Closes the observation window
    /// once it has elapsed.
    pub fn report_success(&self, version: u64) {
        let mut st = self.lock_state();
        let expired = matches!(
            &st.observation,
            Some(o) if o.version == version && o.started.elapsed() >= self.cfg.observation_window
        );
        if expired {
            st.observation = None;
        }
    }

    /// Inference against `version` failed. Returns `true` if this failure
    /// tipped the registry into reverting to the previous artifact.
    pub fn report_failure(&self, version: u64) -> bool {
        let (from, to, failures) = {
            let mut st = self.lock_state();
            let window = self.cfg.observation_window;
            let budget = self.cfg.retry_budget;
            let Some(obs) = st.observation.as_mut() else {
                return false;
            };
            if obs.version != version {
                return false;
            }
            if obs.started.elapsed() > window {
                st.observation = None;
                return false;
            }
            obs.failures += 1;
            let failures = obs.failures;
            if failures <= budget {
                return false;
            }
            let Some(prev) = st.history.pop_back() else {
                st.observation = None;
                return false;
            };
            st.observation = None;
            let bad = self.current.send_replace(prev.clone());
            (bad, prev, failures)
        };

        error!(
            "🚨 Auto-revert v{} → v{} after {} inference failures in observation window",
            from.version, to.version, failures,
        );
        if let Some(store) = &self.store {
            if let Err(e) = store.set_current(to.version) {
                error!("artifact store pointer update failed during revert: {e}");
            }
        }
        self.audit(
            AuditRecord::new(AuditAction::Reverted, &from, Some(to.version))
                .with_reason(format!("{failures} inference failures")),
        );
        self.alert(AlertKind::AutoReverted {
            from: from.version,
            to: to.version,
            failures,
        });
        true
    }

    fn alert(&self, kind: AlertKind) {
        self.alerts.send_replace(Some(RegistryAlert { at: Utc::now(), kind }));
    }

    fn audit(&self, record: AuditRecord) {
        if let Some(store) = &self.store {
            if let Err(e) = store.audit(&record) {
                warn!("audit write failed: {e}");
            }
        }
    }
}
