//! Process configuration.
//!
//! Every actor config has a `Default` and a `from_env()`. Values come from
//! `EDGE_*` environment variables (a `.env` file is loaded first by the
//! binaries). A variable that is set but cannot be parsed is an error: the
//! service refuses to start rather than run with a silently ignored knob.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use url::Url;

use crate::error::ConfigError;
use crate::live::broadcaster::BroadcasterConfig;
use crate::live::comparator::ComparatorConfig;
use crate::live::features::FeatureConfig;
use crate::live::session::SessionConfig;
use crate::model::registry::RegistryConfig;
use crate::model::retrainer::RetrainConfig;

/// Parse `key` if set. Empty values count as unset.
pub fn env_parse<T>(key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::invalid(key, format!("{v:?}: {e}"))),
        _ => Ok(None),
    }
}

/// Boolean flag: 1/0, true/false, yes/no, on/off.
pub fn env_flag(key: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => parse_flag(&v)
            .map(Some)
            .ok_or_else(|| ConfigError::invalid(key, format!("{v:?} is not a boolean"))),
        _ => Ok(None),
    }
}

fn parse_flag(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Process-level settings not owned by any single actor.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub admin_addr: SocketAddr,
    /// Odds collaborator base URL. Unset: every session keeps the mock market.
    pub odds_url: Option<Url>,
    pub odds_poll: Duration,
    pub upstream_cache_ttl: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            log_dir: PathBuf::from("./logs"),
            admin_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            odds_url: None,
            odds_poll: Duration::from_millis(5_000),
            upstream_cache_ttl: Duration::from_millis(30_000),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse::<PathBuf>("EDGE_DATA_DIR")? { c.data_dir = v; }
        if let Some(v) = env_parse::<PathBuf>("EDGE_LOG_DIR")? { c.log_dir = v; }
        if let Some(v) = env_parse("EDGE_ADMIN_ADDR")? { c.admin_addr = v; }
        if let Some(v) = env_parse("EDGE_ODDS_URL")? { c.odds_url = Some(v); }
        if let Some(v) = env_parse("EDGE_ODDS_POLL_MS")? { c.odds_poll = Duration::from_millis(v); }
        if let Some(v) = env_parse("EDGE_UPSTREAM_CACHE_TTL_MS")? { c.upstream_cache_ttl = Duration::from_millis(v); }
        if c.odds_poll.is_zero() {
            return Err(ConfigError::invalid("EDGE_ODDS_POLL_MS", "must be > 0"));
        }
        Ok(c)
    }

    pub fn corpus_path(&self) -> PathBuf {
        self.data_dir.join("corpus").join("training.jsonl")
    }

    pub fn models_dir(&self) -> PathBuf {
        self.data_dir.join("models")
    }
}

#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    pub service: ServiceConfig,
    pub features: FeatureConfig,
    pub comparator: ComparatorConfig,
    pub session: SessionConfig,
    pub broadcaster: BroadcasterConfig,
    pub registry: RegistryConfig,
    pub retrain: RetrainConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let c = Self {
            service: ServiceConfig::from_env()?,
            features: FeatureConfig::from_env()?,
            comparator: ComparatorConfig::from_env()?,
            session: SessionConfig::from_env()?,
            broadcaster: BroadcasterConfig::from_env()?,
            registry: RegistryConfig::from_env()?,
            retrain: RetrainConfig::from_env()?,
        };
        c.validate()?;
        Ok(c)
    }

    /// Cross-field checks on top of the per-actor ones.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.features.validate()?;
        self.comparator.validate()?;
        self.session.validate()?;
        self.registry.validate()?;
        self.retrain.validate()?;
        if self.session.stale_after >= self.session.inactivity_timeout {
            return Err(ConfigError::invalid(
                "EDGE_STALE_AFTER_MS",
                "must be shorter than EDGE_INACTIVITY_TIMEOUT_MS",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Each test uses its own variable names; the process environment is shared.

    #[test]
    fn test_env_parse_unset_and_valid() {
        assert_eq!(env_parse::<u64>("EDGE_TEST_UNSET_KEY").unwrap(), None);
        std::env::set_var("EDGE_TEST_PARSE_OK", " 42 ");
        assert_eq!(env_parse::<u64>("EDGE_TEST_PARSE_OK").unwrap(), Some(42));
    }

    #[test]
    fn test_env_parse_garbage_fails_fast() {
        std::env::set_var("EDGE_TEST_PARSE_BAD", "0.2x");
        let err = env_parse::<f64>("EDGE_TEST_PARSE_BAD").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "EDGE_TEST_PARSE_BAD", .. }));
    }

    #[test]
    fn test_flags() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
        std::env::set_var("EDGE_TEST_FLAG_BAD", "maybe");
        assert!(env_flag("EDGE_TEST_FLAG_BAD").is_err());
    }

    #[test]
    fn test_defaults_validate() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn test_stale_must_precede_inactivity() {
        let mut c = AppConfig::default();
        c.session.stale_after = c.session.inactivity_timeout;
        assert!(c.validate().is_err());
    }
}
