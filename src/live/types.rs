use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::TelemetryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Radiant,
    Dire,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Radiant => "RADIANT",
            Side::Dire => "DIRE",
        }
    }

    pub fn parse(s: &str) -> Option<Side> {
        match s.trim().to_ascii_lowercase().as_str() {
            "radiant" => Some(Side::Radiant),
            "dire" => Some(Side::Dire),
            _ => None,
        }
    }
}

/// Upstream match identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MatchId(pub String);

impl MatchId {
    pub fn new(id: impl Into<String>) -> Self {
        MatchId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(&self.0)
    }
}

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lifecycle {
    Created,
    Live,
    Ended,
}

/// One participant as reported by the telemetry feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub side: Side,
    pub net_worth: f64,
    pub xp: f64,
    pub buyback_available: bool,
}

/// Fully typed telemetry tick. Every field already carries its default,
/// so nothing downstream deals with partial data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawTelemetry {
    pub elapsed_secs: f64,
    pub radiant_score: u32,
    pub dire_score: u32,
    pub radiant_net_worth: f64,
    pub dire_net_worth: f64,
    pub radiant_xp: f64,
    pub dire_xp: f64,
    pub players: Vec<PlayerState>,
    /// Set when the feed itself reports a decided game.
    pub winner: Option<Side>,
}

impl Default for RawTelemetry {
    fn default() -> Self {
        Self {
            elapsed_secs: 0.0,
            radiant_score: 0,
            dire_score: 0,
            radiant_net_worth: 0.0,
            dire_net_worth: 0.0,
            radiant_xp: 0.0,
            dire_xp: 0.0,
            players: Vec::new(),
            winner: None,
        }
    }
}

impl RawTelemetry {
    /// Parse a GSI-shaped payload.
    ///
    /// Accepted layout: `map.{clock_time, radiant_score, dire_score,
    /// radiant_gold, dire_gold, radiant_xp, dire_xp, win_team}` and a
    /// `players`/`allplayers` collection (object keyed by slot, or array).
    /// Team totals fall back to per-player sums when the map omits them.
    pub fn from_json(value: &Value) -> Result<Self, TelemetryError> {
        let root = value.as_object().ok_or(TelemetryError::NotAnObject)?;
        let empty = Map::new();
        let map = match root.get("map") {
            None | Some(Value::Null) => &empty,
            Some(Value::Object(m)) => m,
            Some(other) => {
                return Err(TelemetryError::BadField {
                    field: "map",
                    reason: format!("expected object, got {}", kind(other)),
                })
            }
        };

        let clock = match num(map, "clock_time")? {
            Some(c) => Some(c),
            None => num(root, "game_time")?,
        };
        // Pre-horn clocks are negative; they count as time zero.
        let elapsed_secs = clock.unwrap_or(0.0).max(0.0);

        let players = parse_players(root)?;
        let sum = |side: Side, f: fn(&PlayerState) -> f64| -> f64 {
            players.iter().filter(|p| p.side == side).map(f).sum()
        };

        let radiant_net_worth = match num(map, "radiant_gold")? {
            Some(v) => v,
            None => sum(Side::Radiant, |p| p.net_worth),
        };
        let dire_net_worth = match num(map, "dire_gold")? {
            Some(v) => v,
            None => sum(Side::Dire, |p| p.net_worth),
        };
        let radiant_xp = match num(map, "radiant_xp")? {
            Some(v) => v,
            None => sum(Side::Radiant, |p| p.xp),
        };
        let dire_xp = match num(map, "dire_xp")? {
            Some(v) => v,
            None => sum(Side::Dire, |p| p.xp),
        };

        let winner = map
            .get("win_team")
            .and_then(Value::as_str)
            .and_then(Side::parse);

        Ok(Self {
            elapsed_secs,
            radiant_score: num(map, "radiant_score")?.unwrap_or(0.0).max(0.0) as u32,
            dire_score: num(map, "dire_score")?.unwrap_or(0.0).max(0.0) as u32,
            radiant_net_worth,
            dire_net_worth,
            radiant_xp,
            dire_xp,
            players,
            winner,
        })
    }

    pub fn players_on(&self, side: Side) -> impl Iterator<Item = &PlayerState> {
        self.players.iter().filter(move |p| p.side == side)
    }
}

fn kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Missing or null → `None`; a number → `Some`; anything else is malformed.
fn num(obj: &Map<String, Value>, key: &'static str) -> Result<Option<f64>, TelemetryError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(other) => Err(TelemetryError::BadField {
            field: key,
            reason: format!("expected number, got {}", kind(other)),
        }),
    }
}

fn parse_players(root: &Map<String, Value>) -> Result<Vec<PlayerState>, TelemetryError> {
    let raw = match root.get("players").or_else(|| root.get("allplayers")) {
        None | Some(Value::Null) => return Ok(Vec::new()),
        Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
        Some(Value::Object(m)) => m.values().collect::<Vec<_>>(),
        Some(other) => {
            return Err(TelemetryError::BadField {
                field: "players",
                reason: format!("expected array or object, got {}", kind(other)),
            })
        }
    };

    let mut players = Vec::with_capacity(raw.len());
    for (idx, item) in raw.into_iter().enumerate() {
        // Non-object entries (spectator placeholders) are skipped.
        let Some(p) = item.as_object() else { continue };
        let side = player_side(p, idx);
        let net_worth = match num(p, "net_worth")? {
            Some(v) => v,
            None => num(p, "gold")?.unwrap_or(0.0),
        };
        let buyback_available = p
            .get("buyback_available")
            .or_else(|| p.get("has_buyback"))
            .and_then(Value::as_bool)
            .unwrap_or(false);
        players.push(PlayerState {
            side,
            net_worth: net_worth.max(0.0),
            xp: num(p, "xp")?.unwrap_or(0.0).max(0.0),
            buyback_available,
        });
    }
    Ok(players)
}

fn player_side(p: &Map<String, Value>, idx: usize) -> Side {
    if let Some(side) = p
        .get("team_name")
        .or_else(|| p.get("team"))
        .and_then(Value::as_str)
        .and_then(Side::parse)
    {
        return side;
    }
    if let Some(radiant) = p.get("isRadiant").and_then(Value::as_bool) {
        return if radiant { Side::Radiant } else { Side::Dire };
    }
    if let Some(slot) = p.get("team_slot").and_then(Value::as_u64) {
        return if slot < 5 { Side::Radiant } else { Side::Dire };
    }
    if let Some(slot) = p.get("player_slot").and_then(Value::as_u64) {
        return if slot < 128 { Side::Radiant } else { Side::Dire };
    }
    if idx < 5 {
        Side::Radiant
    } else {
        Side::Dire
    }
}

/// Precomputed draft scores from the draft collaborator, consumed as-is.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DraftContext {
    /// Synergy/counter differential, radiant minus dire.
    pub synergy_counter_diff: f64,
    /// Late-game scaling differential, radiant minus dire.
    pub late_game_diff: f64,
}

impl Default for DraftContext {
    fn default() -> Self {
        Self {
            synergy_counter_diff: 0.0,
            late_game_diff: 0.0,
        }
    }
}

/// Pre-aggregated team form and playstyle.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TeamIdentity {
    pub radiant_recent_winrate: f64,
    pub dire_recent_winrate: f64,
    /// 0 = fast games, 1 = slow games.
    pub radiant_pace: f64,
    pub dire_pace: f64,
    pub radiant_aggression: f64,
    pub dire_aggression: f64,
}

impl Default for TeamIdentity {
    fn default() -> Self {
        Self {
            radiant_recent_winrate: 0.5,
            dire_recent_winrate: 0.5,
            radiant_pace: 0.5,
            dire_pace: 0.5,
            radiant_aggression: 0.0,
            dire_aggression: 0.0,
        }
    }
}

/// Market view of the match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MarketState {
    pub odds_radiant: f64,
    pub odds_dire: f64,
    /// Radiant win probability with the bookmaker margin removed.
    pub implied_probability: f64,
    pub is_mock: bool,
    pub updated_at: DateTime<Utc>,
}

impl MarketState {
    /// Stand-in used when no real odds are available.
    pub fn mock() -> Self {
        Self {
            odds_radiant: 2.0,
            odds_dire: 2.0,
            implied_probability: 0.5,
            is_mock: true,
            updated_at: Utc::now(),
        }
    }

    /// Build from decimal odds, removing the margin. Unusable odds yield
    /// the mock market.
    pub fn from_decimal_odds(odds_radiant: f64, odds_dire: f64) -> Self {
        let usable = |o: f64| o.is_finite() && o > 1.0;
        if !usable(odds_radiant) || !usable(odds_dire) {
            return Self::mock();
        }
        let r = 1.0 / odds_radiant;
        let d = 1.0 / odds_dire;
        Self {
            odds_radiant,
            odds_dire,
            implied_probability: r / (r + d),
            is_mock: false,
            updated_at: Utc::now(),
        }
    }
}

impl Default for MarketState {
    fn default() -> Self {
        Self::mock()
    }
}

/// Identifiers attached to a session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchMeta {
    pub radiant_team: Option<String>,
    pub dire_team: Option<String>,
    pub league_id: Option<u64>,
    /// Match confirmed to exist by an upstream listing.
    pub verified: bool,
}
