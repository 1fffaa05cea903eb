//! Feature vector fed to the win-probability ports.
//!
//! Order is fixed: model coefficients are stored by name but evaluated by
//! index, so a new feature must be appended, never inserted.

use crate::models::RawPlay;

/// Static description of one model input.
#[derive(Debug, Clone, Copy)]
pub struct FeatureDef {
    pub name: &'static str,
    pub display_name: &'static str,
    /// Value used when the source does not provide one.
    pub fill: f64,
}

pub const FEATURE_COUNT: usize = 14;

pub const FEATURES: [FeatureDef; FEATURE_COUNT] = [
    FeatureDef { name: "down", display_name: "Down", fill: 0.0 },
    FeatureDef { name: "yards_to_go", display_name: "Yards to Go", fill: 10.0 },
    FeatureDef { name: "yardline_100", display_name: "Field Position", fill: 50.0 },
    FeatureDef { name: "game_seconds_remaining", display_name: "Time Remaining", fill: 3600.0 },
    FeatureDef { name: "half_seconds_remaining", display_name: "Half Time Remaining", fill: 1800.0 },
    FeatureDef { name: "score_differential", display_name: "Score Differential", fill: 0.0 },
    FeatureDef { name: "posteam_is_home", display_name: "Possession (Home)", fill: 0.5 },
    FeatureDef { name: "posteam_timeouts_remaining", display_name: "Offense Timeouts", fill: 3.0 },
    FeatureDef { name: "defteam_timeouts_remaining", display_name: "Defense Timeouts", fill: 3.0 },
    FeatureDef { name: "receive_2h_ko", display_name: "Receives 2nd-Half Kickoff", fill: 0.0 },
    FeatureDef { name: "spread_line", display_name: "Pre-game Spread", fill: 0.0 },
    FeatureDef { name: "spread_time", display_name: "Spread × Time Remaining", fill: 0.0 },
    FeatureDef { name: "diff_time_ratio", display_name: "Lead × Time Elapsed", fill: 0.0 },
    FeatureDef { name: "ep", display_name: "Expected Points", fill: 0.0 },
];

const REGULATION_SECS: f64 = 3600.0;

pub fn feature_index(name: &str) -> Option<usize> {
    FEATURES.iter().position(|f| f.name == name)
}

pub fn display_name(name: &str) -> &str {
    FEATURES
        .iter()
        .find(|f| f.name == name)
        .map(|f| f.display_name)
        .unwrap_or(name)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FeatureVector([f64; FEATURE_COUNT]);

impl FeatureVector {
    pub fn from_values(values: [f64; FEATURE_COUNT]) -> Self {
        Self(values)
    }

    /// Build the vector for one play, applying fill values and the derived
    /// time-interaction features.
    pub fn from_play(play: &RawPlay) -> Self {
        let fill = |idx: usize, v: Option<f64>| v.filter(|x| x.is_finite()).unwrap_or(FEATURES[idx].fill);
        let flag = |b: Option<bool>| b.map(|v| if v { 1.0 } else { 0.0 });

        let game_secs = fill(3, play.game_seconds_remaining.map(f64::from));
        let spread = fill(10, play.spread_line);
        let diff = play.score_differential() as f64;

        Self([
            fill(0, play.down.map(f64::from)),
            fill(1, play.yards_to_go.map(f64::from)),
            fill(2, play.yardline_100.map(f64::from)),
            game_secs,
            fill(4, play.half_seconds_remaining.map(f64::from)),
            diff,
            fill(6, flag(play.posteam_is_home)),
            fill(7, play.posteam_timeouts_remaining.map(f64::from)),
            fill(8, play.defteam_timeouts_remaining.map(f64::from)),
            fill(9, flag(play.receive_2h_ko)),
            spread,
            spread * (game_secs / REGULATION_SECS),
            diff * (1.0 - game_secs / REGULATION_SECS),
            fill(13, play.ep),
        ])
    }

    pub fn values(&self) -> &[f64; FEATURE_COUNT] {
        &self.0
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        feature_index(name).map(|i| self.0[i])
    }

    /// (definition, value) pairs in model order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static FeatureDef, f64)> + '_ {
        FEATURES.iter().zip(self.0.iter().copied())
    }
}
