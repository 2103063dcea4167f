//! Market comparator: calibrated probability vs market-implied probability.

use serde::{Deserialize, Serialize};

use super::types::{MarketState, Side};
use crate::config::{env_flag, env_parse};
use crate::error::ConfigError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Tier {
    Skip,
    Lean,
    Strong,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MispricingSignal {
    /// calibrated − implied, clamped to [-1, 1].
    pub index: f64,
    pub tier: Tier,
    /// Radiant when `index >= 0`.
    pub favored: Side,
    pub implied_probability: f64,
    pub is_mock: bool,
}

#[derive(Debug, Clone)]
pub struct ComparatorConfig {
    /// |index| below this → SKIP.
    pub skip_threshold: f64,
    /// |index| at or above this → STRONG.
    pub strong_threshold: f64,
    /// Force SKIP while the market is mock (index is still reported).
    pub suppress_mock_signal: bool,
}

impl Default for ComparatorConfig {
    fn default() -> Self {
        Self {
            skip_threshold: 0.05,
            strong_threshold: 0.20,
            suppress_mock_signal: false,
        }
    }
}

impl ComparatorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse("EDGE_SKIP_THRESHOLD")? { c.skip_threshold = v; }
        if let Some(v) = env_parse("EDGE_STRONG_THRESHOLD")? { c.strong_threshold = v; }
        if let Some(v) = env_flag("EDGE_SUPPRESS_MOCK_SIGNAL")? { c.suppress_mock_signal = v; }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let (skip, strong) = (self.skip_threshold, self.strong_threshold);
        if !skip.is_finite() || skip < 0.0 {
            return Err(ConfigError::invalid("EDGE_SKIP_THRESHOLD", format!("{skip} must be >= 0")));
        }
        if !strong.is_finite() || strong <= skip || strong > 1.0 {
            return Err(ConfigError::invalid(
                "EDGE_STRONG_THRESHOLD",
                format!("{strong} must be in ({skip}, 1]"),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct MarketComparator {
    cfg: ComparatorConfig,
}

impl MarketComparator {
    pub fn new(cfg: ComparatorConfig) -> Self {
        Self { cfg }
    }

    pub fn compare(&self, calibrated: f64, market: &MarketState) -> MispricingSignal {
        let (implied, is_mock) = if market.is_mock || !market.implied_probability.is_finite() {
            (0.5, true)
        } else {
            (market.implied_probability, false)
        };
        let index = if calibrated.is_finite() {
            (calibrated - implied).clamp(-1.0, 1.0)
        } else {
            0.0
        };
        let tier = if is_mock && self.cfg.suppress_mock_signal {
            Tier::Skip
        } else {
            self.tier(index)
        };
        MispricingSignal {
            index,
            tier,
            favored: if index >= 0.0 { Side::Radiant } else { Side::Dire },
            implied_probability: implied,
            is_mock,
        }
    }

    fn tier(&self, index: f64) -> Tier {
        let a = index.abs();
        if a < self.cfg.skip_threshold {
            Tier::Skip
        } else if a < self.cfg.strong_threshold {
            Tier::Lean
        } else {
            Tier::Strong
        }
    }
}
