//! Game, play, prediction and wire-message types shared across the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a game.
///
/// `InProgress` is the "running" state and `Final` the "finished" state. A run
/// that ends early lands in `Interrupted` (stopped) or `Failed` (store or
/// source failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GameStatus {
    Scheduled,
    InProgress,
    Final,
    Interrupted,
    Failed,
}

impl GameStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GameStatus::Scheduled => "scheduled",
            GameStatus::InProgress => "in_progress",
            GameStatus::Final => "final",
            GameStatus::Interrupted => "interrupted",
            GameStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GameStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(GameStatus::Scheduled),
            "in_progress" | "running" => Ok(GameStatus::InProgress),
            "final" | "finished" => Ok(GameStatus::Final),
            "interrupted" => Ok(GameStatus::Interrupted),
            "failed" => Ok(GameStatus::Failed),
            other => Err(format!("invalid game status '{}'", other)),
        }
    }
}

/// A persisted game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub status: GameStatus,
    pub external_id: Option<String>,
    pub home_score: i64,
    pub away_score: i64,
    pub created_at: String,
    pub updated_at: String,
}

/// Fields needed to register a game before its first run.
#[derive(Debug, Clone, Default)]
pub struct NewGame {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub external_id: Option<String>,
}

/// One play as produced by an event source, before the orchestrator assigns
/// it a sequence number.
///
/// `occurred_at_secs` is the play's declared timestamp on the event's own
/// clock. Pacing uses the gap between consecutive timestamps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawPlay {
    #[serde(default)]
    pub occurred_at_secs: Option<f64>,
    #[serde(default = "default_quarter")]
    pub quarter: u32,
    /// Seconds left on the quarter clock.
    #[serde(default)]
    pub clock_seconds: u32,
    #[serde(default)]
    pub game_seconds_remaining: Option<u32>,
    #[serde(default)]
    pub half_seconds_remaining: Option<u32>,
    #[serde(default)]
    pub down: Option<u8>,
    #[serde(default)]
    pub yards_to_go: Option<u32>,
    /// Distance from the opponent end zone (1-99).
    #[serde(default)]
    pub yardline_100: Option<u32>,
    #[serde(default)]
    pub score_home: i64,
    #[serde(default)]
    pub score_away: i64,
    #[serde(default)]
    pub posteam: Option<String>,
    #[serde(default)]
    pub defteam: Option<String>,
    #[serde(default)]
    pub posteam_is_home: Option<bool>,
    #[serde(default)]
    pub receive_2h_ko: Option<bool>,
    #[serde(default)]
    pub posteam_timeouts_remaining: Option<u8>,
    #[serde(default)]
    pub defteam_timeouts_remaining: Option<u8>,
    #[serde(default)]
    pub spread_line: Option<f64>,
    #[serde(default)]
    pub ep: Option<f64>,
    #[serde(default)]
    pub play_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Source row, kept for audit in `play_raw`.
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub raw: serde_json::Value,
}

fn default_quarter() -> u32 {
    1
}

impl RawPlay {
    pub fn score_differential(&self) -> i64 {
        self.score_home - self.score_away
    }

    pub fn yardline_from_own(&self) -> Option<u32> {
        self.yardline_100.map(|y| 100u32.saturating_sub(y))
    }

    /// Regulation or overtime has expired with one side ahead.
    pub fn is_decided(&self) -> bool {
        self.quarter >= 4 && self.clock_seconds == 0 && self.score_differential() != 0
    }
}

/// Play as it appears on the wire and in history reads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Play {
    pub sequence: u64,
    pub quarter: u32,
    pub clock_seconds: u32,
    pub score_home: i64,
    pub score_away: i64,
    pub down: Option<u8>,
    pub yards_to_go: Option<u32>,
    pub yardline_from_own: Option<u32>,
    pub play_type: Option<String>,
    pub description: Option<String>,
    pub posteam: Option<String>,
}

impl Play {
    pub fn from_raw(sequence: u64, raw: &RawPlay) -> Self {
        Self {
            sequence,
            quarter: raw.quarter,
            clock_seconds: raw.clock_seconds,
            score_home: raw.score_home,
            score_away: raw.score_away,
            down: raw.down,
            yards_to_go: raw.yards_to_go,
            yardline_from_own: raw.yardline_from_own(),
            play_type: raw.play_type.clone(),
            description: raw.description.clone(),
            posteam: raw.posteam.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Positive,
    Negative,
}

impl Direction {
    pub fn of(value: f64) -> Self {
        if value >= 0.0 {
            Direction::Positive
        } else {
            Direction::Negative
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Positive => "positive",
            Direction::Negative => "negative",
        }
    }
}

/// One ranked entry of an explanation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attribution {
    pub feature: String,
    pub value: f64,
    pub direction: Direction,
    pub display_name: String,
}

impl Attribution {
    pub fn new(feature: &str, value: f64, display_name: &str) -> Self {
        Self {
            feature: feature.to_string(),
            value,
            direction: Direction::of(value),
            display_name: display_name.to_string(),
        }
    }
}

/// Sort by absolute contribution, largest first.
pub fn rank_attributions(attributions: &mut [Attribution]) {
    attributions.sort_by(|a, b| {
        b.value
            .abs()
            .partial_cmp(&a.value.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Prediction and explanation for exactly one play. Never updated after it is
/// written; a re-run writes new plays and new records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub model_version: String,
    pub home_wp: Option<f64>,
    pub away_wp: Option<f64>,
    pub attributions: Vec<Attribution>,
    pub degraded: bool,
    pub degraded_reason: Option<String>,
}

/// Wire message: tagged union discriminated by `event_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum StreamEvent {
    PlayUpdate(PlayUpdate),
    GameStatus(GameStatusUpdate),
    ReplayComplete { game_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayUpdate {
    pub game_id: String,
    pub play: Play,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub home_win_probability: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub away_win_probability: Option<f64>,
    pub top_attributions: Vec<Attribution>,
    pub model_version: String,
    /// Set when a port failed for this play; the UI shows "explanation unavailable".
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameStatusUpdate {
    pub game_id: String,
    pub status: GameStatus,
    pub home_score: i64,
    pub away_score: i64,
}

impl StreamEvent {
    pub fn play_update(game_id: &str, play: Play, record: &PredictionRecord) -> Self {
        StreamEvent::PlayUpdate(PlayUpdate {
            game_id: game_id.to_string(),
            play,
            home_win_probability: record.home_wp,
            away_win_probability: record.away_wp,
            top_attributions: record.attributions.clone(),
            model_version: record.model_version.clone(),
            degraded: record.degraded,
        })
    }

    pub fn game_status(game_id: &str, status: GameStatus, home_score: i64, away_score: i64) -> Self {
        StreamEvent::GameStatus(GameStatusUpdate {
            game_id: game_id.to_string(),
            status,
            home_score,
            away_score,
        })
    }

    pub fn replay_complete(game_id: &str) -> Self {
        StreamEvent::ReplayComplete {
            game_id: game_id.to_string(),
        }
    }

    pub fn game_id(&self) -> &str {
        match self {
            StreamEvent::PlayUpdate(u) => &u.game_id,
            StreamEvent::GameStatus(s) => &s.game_id,
            StreamEvent::ReplayComplete { game_id } => game_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            StreamEvent::PlayUpdate(_) => "play_update",
            StreamEvent::GameStatus(_) => "game_status",
            StreamEvent::ReplayComplete { .. } => "replay_complete",
        }
    }

    pub fn sequence(&self) -> Option<u64> {
        match self {
            StreamEvent::PlayUpdate(u) => Some(u.play.sequence),
            _ => None,
        }
    }

    /// The gateway closes the stream after forwarding a terminal message.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::ReplayComplete { .. })
    }

    /// Terminal messages are never cached as "latest": a late joiner should be
    /// seeded with state, not told to hang up.
    pub fn is_cacheable(&self) -> bool {
        !self.is_terminal()
    }
}

/// One history row: a play joined with its prediction record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub run_id: String,
    pub play: Play,
    pub home_win_probability: Option<f64>,
    pub away_win_probability: Option<f64>,
    pub top_attributions: Vec<Attribution>,
    pub model_version: Option<String>,
    pub degraded: bool,
    pub created_at: String,
}
