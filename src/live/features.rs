//! Feature extraction: typed match state → fixed 19-value vector.
//!
//! Pure and synchronous. Every feature has a default used when its source is
//! unavailable, so the shape and meaning of the vector never change between
//! calls.
//!
//! | # | name | range | default |
//! |---|------|-------|---------|
//! | 0 | game_time | ≥ 0 | 0 |
//! | 1 | game_time_normalized | [0, 1] | 0 |
//! | 2 | gold_diff | finite | 0 |
//! | 3 | gold_diff_normalized | [-1, 1] | 0 |
//! | 4 | xp_diff | finite | 0 |
//! | 5 | xp_diff_normalized | [-1, 1] | 0 |
//! | 6 | networth_velocity | finite, per second | 0 |
//! | 7 | networth_gini | [0, 1] | 0 |
//! | 8 | kill_diff_normalized | [-1, 1] | 0 |
//! | 9 | draft_score_diff | finite | 0 |
//! | 10 | late_game_score_diff | finite | 0 |
//! | 11 | carry_efficiency_index | [0.5, 2] | 1 |
//! | 12 | buyback_power_ratio | [-1, 1] | 0 |
//! | 13 | radiant_recent_winrate | [0, 1] | 0.5 |
//! | 14 | dire_recent_winrate | [0, 1] | 0.5 |
//! | 15 | radiant_pace_score | [0, 1] | 0.5 |
//! | 16 | dire_pace_score | [0, 1] | 0.5 |
//! | 17 | radiant_aggression_score | [-1, 1] | 0 |
//! | 18 | dire_aggression_score | [-1, 1] | 0 |

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use super::types::{DraftContext, RawTelemetry, Side, TeamIdentity};
use crate::config::env_parse;
use crate::error::{ConfigError, TelemetryError};

pub const FEATURE_COUNT: usize = 19;

pub const FEATURE_NAMES: [&str; FEATURE_COUNT] = [
    // time
    "game_time",
    "game_time_normalized",
    // economy
    "gold_diff",
    "gold_diff_normalized",
    "xp_diff",
    "xp_diff_normalized",
    "networth_velocity",
    "networth_gini",
    "kill_diff_normalized",
    // draft
    "draft_score_diff",
    "late_game_score_diff",
    // efficiency
    "carry_efficiency_index",
    "buyback_power_ratio",
    // team identity
    "radiant_recent_winrate",
    "dire_recent_winrate",
    "radiant_pace_score",
    "dire_pace_score",
    "radiant_aggression_score",
    "dire_aggression_score",
];

const MAX_GOLD_DIFF: f64 = 50_000.0;
const MAX_XP_DIFF: f64 = 30_000.0;

/// Expected carry net worth by game second.
const CARRY_GOLD_BENCHMARKS: [(f64, f64); 6] = [
    (600.0, 4_000.0),
    (1_200.0, 10_000.0),
    (1_800.0, 18_000.0),
    (2_400.0, 28_000.0),
    (3_000.0, 38_000.0),
    (3_600.0, 50_000.0),
];

#[derive(Debug, Clone)]
pub struct FeatureConfig {
    /// Normaliser for elapsed time. Default: 3600s.
    pub expected_match_secs: f64,
    /// Trailing window for net-worth velocity. Default: 60s.
    pub velocity_window_secs: f64,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            expected_match_secs: 3_600.0,
            velocity_window_secs: 60.0,
        }
    }
}

impl FeatureConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut c = Self::default();
        if let Some(v) = env_parse("EDGE_EXPECTED_MATCH_SECS")? { c.expected_match_secs = v; }
        if let Some(v) = env_parse("EDGE_VELOCITY_WINDOW_SECS")? { c.velocity_window_secs = v; }
        c.validate()?;
        Ok(c)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.expected_match_secs.is_finite() && self.expected_match_secs > 0.0) {
            return Err(ConfigError::invalid("EDGE_EXPECTED_MATCH_SECS", "must be > 0"));
        }
        if !(self.velocity_window_secs.is_finite() && self.velocity_window_secs > 0.0) {
            return Err(ConfigError::invalid("EDGE_VELOCITY_WINDOW_SECS", "must be > 0"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureVector {
    values: [f64; FEATURE_COUNT],
}

impl FeatureVector {
    pub fn as_slice(&self) -> &[f64] {
        &self.values
    }

    pub fn to_vec(&self) -> Vec<f64> {
        self.values.to_vec()
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        FEATURE_NAMES
            .iter()
            .position(|n| *n == name)
            .map(|i| self.values[i])
    }
}

/// Trailing (game second, gold diff) samples kept by the session owner.
/// Ordered by game time; a repeated game time replaces the old sample.
#[derive(Debug, Clone, Default)]
pub struct EconomyHistory {
    samples: VecDeque<(f64, f64)>,
}

impl EconomyHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, game_time: f64, gold_diff: f64) {
        if !game_time.is_finite() || !gold_diff.is_finite() {
            return;
        }
        let pos = self.samples.partition_point(|(t, _)| *t < game_time);
        match self.samples.get_mut(pos) {
            Some(slot) if slot.0 == game_time => slot.1 = gold_diff,
            _ => self.samples.insert(pos, (game_time, gold_diff)),
        }
    }

    /// Drop samples older than `horizon` seconds before the newest one.
    pub fn prune(&mut self, horizon: f64) {
        let Some(&(newest, _)) = self.samples.back() else {
            return;
        };
        let cutoff = newest - horizon;
        while let Some(&(t, _)) = self.samples.front() {
            if t < cutoff {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Gold-diff change per second between `now` and the sample closest to
    /// `now - window` (the oldest sample when the window is not yet filled).
    pub fn velocity(&self, now: f64, current_diff: f64, window: f64) -> f64 {
        let target = now - window;
        let mut base: Option<(f64, f64)> = None;
        for &(t, g) in &self.samples {
            if t > now {
                break;
            }
            if base.is_none() || t <= target {
                base = Some((t, g));
            }
        }
        match base {
            Some((t, g)) if now - t > 0.0 => (current_diff - g) / (now - t),
            _ => 0.0,
        }
    }
}

/// Everything the extractor reads for one pass.
#[derive(Debug, Clone, Copy)]
pub struct RawMatchState<'a> {
    pub telemetry: &'a RawTelemetry,
    pub history: &'a EconomyHistory,
    pub draft: &'a DraftContext,
    pub identity: &'a TeamIdentity,
}

pub struct FeatureExtractor {
    cfg: FeatureConfig,
}

impl FeatureExtractor {
    pub fn new(cfg: FeatureConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &FeatureConfig {
        &self.cfg
    }

    pub fn extract(&self, raw: RawMatchState<'_>) -> Result<FeatureVector, TelemetryError> {
        let t = raw.telemetry;
        if !t.elapsed_secs.is_finite() || t.elapsed_secs < 0.0 {
            return Err(TelemetryError::BadClock(t.elapsed_secs));
        }
        let game_time = t.elapsed_secs;

        let gold_diff = finite_or(t.radiant_net_worth - t.dire_net_worth, 0.0);
        let xp_diff = finite_or(t.radiant_xp - t.dire_xp, 0.0);
        let velocity = finite_or(
            raw.history
                .velocity(game_time, gold_diff, self.cfg.velocity_window_secs),
            0.0,
        );

        let kill_diff = t.radiant_score as f64 - t.dire_score as f64;
        // Roughly one kill per minute is expected.
        let expected_kills = (game_time / 60.0).max(1.0);

        let id = raw.identity;
        let values = [
            game_time,
            (game_time / self.cfg.expected_match_secs).clamp(0.0, 1.0),
            gold_diff,
            (gold_diff / MAX_GOLD_DIFF).clamp(-1.0, 1.0),
            xp_diff,
            (xp_diff / MAX_XP_DIFF).clamp(-1.0, 1.0),
            velocity,
            networth_gini(t),
            (kill_diff / (expected_kills * 2.0)).clamp(-1.0, 1.0),
            finite_or(raw.draft.synergy_counter_diff, 0.0),
            finite_or(raw.draft.late_game_diff, 0.0),
            carry_efficiency(t, game_time),
            buyback_power_ratio(t),
            unit(id.radiant_recent_winrate, 0.5),
            unit(id.dire_recent_winrate, 0.5),
            unit(id.radiant_pace, 0.5),
            unit(id.dire_pace, 0.5),
            signed_unit(id.radiant_aggression),
            signed_unit(id.dire_aggression),
        ];
        Ok(FeatureVector { values })
    }
}

impl Default for FeatureExtractor {
    fn default() -> Self {
        Self::new(FeatureConfig::default())
    }
}

fn finite_or(v: f64, default: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        default
    }
}

fn unit(v: f64, default: f64) -> f64 {
    finite_or(v, default).clamp(0.0, 1.0)
}

fn signed_unit(v: f64) -> f64 {
    finite_or(v, 0.0).clamp(-1.0, 1.0)
}

/// Gini coefficient of the leading team's net-worth distribution.
fn networth_gini(t: &RawTelemetry) -> f64 {
    let total = |side| -> f64 { t.players_on(side).map(|p| p.net_worth).sum() };
    let leader = if total(Side::Radiant) > total(Side::Dire) {
        Side::Radiant
    } else {
        Side::Dire
    };
    let mut nws: Vec<f64> = t
        .players_on(leader)
        .map(|p| p.net_worth)
        .filter(|v| v.is_finite())
        .collect();
    if nws.len() < 2 {
        return 0.0;
    }
    nws.sort_by(|a, b| a.total_cmp(b));
    let n = nws.len() as f64;
    let sum: f64 = nws.iter().sum();
    if sum <= 0.0 {
        return 0.0;
    }
    let weighted: f64 = nws
        .iter()
        .enumerate()
        .map(|(i, nw)| (2.0 * (i as f64 + 1.0) - n - 1.0) * nw)
        .sum();
    finite_or(weighted / (n * sum), 0.0).clamp(0.0, 1.0)
}

/// Radiant carry net worth against the benchmark for this game time.
fn carry_efficiency(t: &RawTelemetry, game_time: f64) -> f64 {
    let benchmark = CARRY_GOLD_BENCHMARKS
        .iter()
        .find(|(mark, _)| game_time <= *mark)
        .map(|(_, gold)| *gold)
        .unwrap_or(CARRY_GOLD_BENCHMARKS[CARRY_GOLD_BENCHMARKS.len() - 1].1);
    let carry = t
        .players_on(Side::Radiant)
        .map(|p| p.net_worth)
        .fold(None, |acc: Option<f64>, nw| Some(acc.map_or(nw, |a| a.max(nw))));
    match carry {
        Some(nw) => finite_or(nw / benchmark, 1.0).clamp(0.5, 2.0),
        None => 1.0,
    }
}

/// Share of radiant players with buyback minus the dire share.
fn buyback_power_ratio(t: &RawTelemetry) -> f64 {
    let share = |side| -> f64 {
        let (avail, n) = t
            .players_on(side)
            .fold((0usize, 0usize), |(a, n), p| (a + p.buyback_available as usize, n + 1));
        if n == 0 {
            0.0
        } else {
            avail as f64 / n as f64
        }
    };
    (share(Side::Radiant) - share(Side::Dire)).clamp(-1.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::live::types::PlayerState;
    use proptest::prelude::*;

    fn player(side: Side, nw: f64, bb: bool) -> PlayerState {
        PlayerState { side, net_worth: nw, xp: nw, buyback_available: bb }
    }

    fn extract(t: &RawTelemetry) -> FeatureVector {
        let h = EconomyHistory::new();
        FeatureExtractor::default()
            .extract(RawMatchState {
                telemetry: t,
                history: &h,
                draft: &DraftContext::default(),
                identity: &TeamIdentity::default(),
            })
            .unwrap()
    }

    #[test]
    fn test_defaults_when_sources_missing() {
        let fv = extract(&RawTelemetry::default());
        assert_eq!(fv.as_slice().len(), FEATURE_COUNT);
        assert_eq!(fv.get("game_time"), Some(0.0));
        assert_eq!(fv.get("networth_gini"), Some(0.0));
        assert_eq!(fv.get("carry_efficiency_index"), Some(1.0));
        assert_eq!(fv.get("buyback_power_ratio"), Some(0.0));
        assert_eq!(fv.get("radiant_recent_winrate"), Some(0.5));
        assert_eq!(fv.get("dire_pace_score"), Some(0.5));
        assert_eq!(fv.get("dire_aggression_score"), Some(0.0));
    }

    #[test]
    fn test_economy_features() {
        let t = RawTelemetry {
            elapsed_secs: 1_800.0,
            radiant_net_worth: 70_000.0,
            dire_net_worth: 10_000.0,
            radiant_xp: 40_000.0,
            dire_xp: 25_000.0,
            radiant_score: 30,
            dire_score: 10,
            ..Default::default()
        };
        let fv = extract(&t);
        assert_eq!(fv.get("gold_diff"), Some(60_000.0));
        assert_eq!(fv.get("gold_diff_normalized"), Some(1.0));
        assert_eq!(fv.get("xp_diff_normalized"), Some(0.5));
        assert_eq!(fv.get("game_time_normalized"), Some(0.5));
        // 20 kills over 30 expected → 20 / 60
        assert!((fv.get("kill_diff_normalized").unwrap() - 20.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn test_gini_uses_leading_team() {
        let t = RawTelemetry {
            players: vec![
                player(Side::Radiant, 10_000.0, false),
                player(Side::Radiant, 10_000.0, false),
                player(Side::Dire, 1_000.0, false),
                player(Side::Dire, 9_000.0, false),
            ],
            ..Default::default()
        };
        // radiant leads with an even split
        assert_eq!(extract(&t).get("networth_gini"), Some(0.0));

        let t = RawTelemetry {
            players: vec![
                player(Side::Radiant, 0.0, false),
                player(Side::Radiant, 30_000.0, false),
                player(Side::Dire, 5_000.0, false),
            ],
            ..Default::default()
        };
        assert!((extract(&t).get("networth_gini").unwrap() - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_carry_efficiency_clamped() {
        let t = RawTelemetry {
            elapsed_secs: 600.0,
            players: vec![player(Side::Radiant, 100_000.0, false)],
            ..Default::default()
        };
        assert_eq!(extract(&t).get("carry_efficiency_index"), Some(2.0));
        let t = RawTelemetry {
            elapsed_secs: 1_200.0,
            players: vec![player(Side::Radiant, 8_000.0, false)],
            ..Default::default()
        };
        assert!((extract(&t).get("carry_efficiency_index").unwrap() - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_buyback_ratio() {
        let t = RawTelemetry {
            players: vec![
                player(Side::Radiant, 1.0, true),
                player(Side::Radiant, 1.0, true),
                player(Side::Dire, 1.0, true),
                player(Side::Dire, 1.0, false),
            ],
            ..Default::default()
        };
        assert_eq!(extract(&t).get("buyback_power_ratio"), Some(0.5));
    }

    #[test]
    fn test_velocity_over_trailing_window() {
        let mut h = EconomyHistory::new();
        h.record(0.0, 0.0);
        h.record(30.0, 1_000.0);
        h.record(60.0, 2_000.0);
        h.record(90.0, 3_000.0);
        // window 60 from t=90 → base sample at t=30
        assert!((h.velocity(90.0, 3_000.0, 60.0) - 2_000.0 / 60.0).abs() < 1e-9);
        // window not yet filled → oldest sample
        assert!((h.velocity(30.0, 1_000.0, 60.0) - 1_000.0 / 30.0).abs() < 1e-9);
        assert_eq!(EconomyHistory::new().velocity(10.0, 5.0, 60.0), 0.0);
    }

    #[test]
    fn test_history_orders_and_dedups() {
        let mut h = EconomyHistory::new();
        h.record(10.0, 100.0);
        h.record(5.0, 50.0);
        h.record(10.0, 120.0);
        h.record(20.0, 200.0);
        assert_eq!(h.len(), 3);
        assert_eq!(h.velocity(10.0, 120.0, 60.0), 70.0 / 5.0);
        h.prune(5.0);
        assert_eq!(h.len(), 1);
    }

    #[test]
    fn test_nan_clock_is_malformed() {
        let t = RawTelemetry { elapsed_secs: f64::NAN, ..Default::default() };
        let h = EconomyHistory::new();
        let err = FeatureExtractor::default().extract(RawMatchState {
            telemetry: &t,
            history: &h,
            draft: &DraftContext::default(),
            identity: &TeamIdentity::default(),
        });
        assert!(matches!(err, Err(TelemetryError::BadClock(_))));
    }

    fn arb_player() -> impl Strategy<Value = PlayerState> {
        (any::<bool>(), 0.0..80_000.0f64, 0.0..60_000.0f64, any::<bool>()).prop_map(
            |(radiant, nw, xp, bb)| PlayerState {
                side: if radiant { Side::Radiant } else { Side::Dire },
                net_worth: nw,
                xp,
                buyback_available: bb,
            },
        )
    }

    fn arb_telemetry() -> impl Strategy<Value = RawTelemetry> {
        (
            0.0..7_200.0f64,
            0u32..120,
            0u32..120,
            0.0..200_000.0f64,
            0.0..200_000.0f64,
            prop::collection::vec(arb_player(), 0..10),
        )
            .prop_map(|(time, rs, ds, rg, dg, players)| RawTelemetry {
                elapsed_secs: time,
                radiant_score: rs,
                dire_score: ds,
                radiant_net_worth: rg,
                dire_net_worth: dg,
                radiant_xp: rg * 0.8,
                dire_xp: dg * 0.8,
                players,
                winner: None,
            })
    }

    proptest! {
        #[test]
        fn prop_vector_is_fixed_finite_and_in_range(
            t in arb_telemetry(),
            samples in prop::collection::vec((0.0..7_200.0f64, -50_000.0..50_000.0f64), 0..20),
            draft in -2.0..2.0f64,
            winrate in -1.0..2.0f64,
        ) {
            let mut h = EconomyHistory::new();
            for (st, sg) in samples { h.record(st, sg); }
            let identity = TeamIdentity { radiant_recent_winrate: winrate, ..Default::default() };
            let d = DraftContext { synergy_counter_diff: draft, late_game_diff: -draft };
            let ex = FeatureExtractor::default();
            let raw = RawMatchState { telemetry: &t, history: &h, draft: &d, identity: &identity };
            let fv = ex.extract(raw).unwrap();
            prop_assert_eq!(fv.as_slice().len(), FEATURE_COUNT);
            prop_assert!(fv.as_slice().iter().all(|v| v.is_finite()));
            let bounded = [
                ("game_time_normalized", 0.0, 1.0),
                ("gold_diff_normalized", -1.0, 1.0),
                ("xp_diff_normalized", -1.0, 1.0),
                ("networth_gini", 0.0, 1.0),
                ("kill_diff_normalized", -1.0, 1.0),
                ("carry_efficiency_index", 0.5, 2.0),
                ("buyback_power_ratio", -1.0, 1.0),
                ("radiant_recent_winrate", 0.0, 1.0),
            ];
            for (name, lo, hi) in bounded {
                let v = fv.get(name).unwrap();
                prop_assert!(v >= lo && v <= hi, "{} = {}", name, v);
            }
            // deterministic
            prop_assert_eq!(ex.extract(raw).unwrap(), fv);
        }
    }
}
