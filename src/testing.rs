//! Closure-backed ports and a three-play fixture for driving the pipeline
//! without a model file.

use crate::features::FeatureVector;
use crate::models::{Attribution, RawPlay};
use crate::ports::{AttributionPort, LinearPorts, ModelHandle, PortError, PortSet, Prediction, PredictionPort};
use crate::source::{ScriptedSource, SourceMetadata};
use std::sync::Arc;

type PredictFn = dyn Fn(&FeatureVector) -> Result<f64, PortError> + Send + Sync;
type ExplainFn = dyn Fn(&FeatureVector) -> Result<Vec<Attribution>, PortError> + Send + Sync;

pub struct FnPrediction {
    f: Box<PredictFn>,
}

impl FnPrediction {
    pub fn new(f: impl Fn(&FeatureVector) -> Result<f64, PortError> + Send + Sync + 'static) -> Self {
        Self { f: Box::new(f) }
    }

    pub fn constant(home_wp: f64) -> Self {
        Self::new(move |_| Ok(home_wp))
    }
}

#[async_trait::async_trait]
impl PredictionPort for FnPrediction {
    async fn predict(&self, model: &ModelHandle, features: &FeatureVector) -> Result<Prediction, PortError> {
        Ok(Prediction {
            home_wp: (self.f)(features)?,
            model_version: model.version_name().to_string(),
        })
    }
}

pub struct FnAttribution {
    f: Box<ExplainFn>,
}

impl FnAttribution {
    pub fn new(
        f: impl Fn(&FeatureVector) -> Result<Vec<Attribution>, PortError> + Send + Sync + 'static,
    ) -> Self {
        Self { f: Box::new(f) }
    }

    pub fn empty() -> Self {
        Self::new(|_| Ok(Vec::new()))
    }
}

#[async_trait::async_trait]
impl AttributionPort for FnAttribution {
    async fn explain(
        &self,
        _model: &ModelHandle,
        features: &FeatureVector,
        top_n: usize,
    ) -> Result<Vec<Attribution>, PortError> {
        let mut attributions = (self.f)(features)?;
        attributions.truncate(top_n);
        Ok(attributions)
    }
}

/// Home win probability after each fixture play.
pub const FIXTURE_HOME_WP: [f64; 3] = [0.50, 0.46, 0.68];

pub fn fixture_metadata() -> SourceMetadata {
    SourceMetadata {
        home_team: "KC".to_string(),
        away_team: "CIN".to_string(),
        external_id: Some("2022_20_CIN_KC".to_string()),
        total_plays: Some(3),
    }
}

/// Kickoff, a 7-yard Cincinnati run, then a Kansas City pick-six.
pub fn fixture_plays() -> Vec<RawPlay> {
    let base = RawPlay {
        quarter: 1,
        posteam: Some("CIN".to_string()),
        defteam: Some("KC".to_string()),
        posteam_is_home: Some(false),
        receive_2h_ko: Some(false),
        posteam_timeouts_remaining: Some(3),
        defteam_timeouts_remaining: Some(3),
        spread_line: Some(1.5),
        ..Default::default()
    };
    vec![
        RawPlay {
            occurred_at_secs: Some(0.0),
            clock_seconds: 900,
            game_seconds_remaining: Some(3600),
            half_seconds_remaining: Some(1800),
            yardline_100: Some(35),
            play_type: Some("kickoff".to_string()),
            description: Some("H.Butker kicks 65 yards from KC 35 to end zone, Touchback.".to_string()),
            ..base.clone()
        },
        RawPlay {
            occurred_at_secs: Some(6.0),
            clock_seconds: 894,
            game_seconds_remaining: Some(3594),
            half_seconds_remaining: Some(1794),
            down: Some(1),
            yards_to_go: Some(10),
            yardline_100: Some(75),
            play_type: Some("run".to_string()),
            description: Some("J.Mixon right end to CIN 32 for 7 yards.".to_string()),
            ..base.clone()
        },
        RawPlay {
            occurred_at_secs: Some(12.0),
            clock_seconds: 888,
            game_seconds_remaining: Some(3588),
            half_seconds_remaining: Some(1788),
            down: Some(2),
            yards_to_go: Some(3),
            yardline_100: Some(68),
            score_home: 6,
            play_type: Some("pass".to_string()),
            description: Some(
                "J.Burrow pass short left intended for J.Chase INTERCEPTED by N.Bolton, TOUCHDOWN."
                    .to_string(),
            ),
            ..base
        },
    ]
}

pub fn fixture_source() -> ScriptedSource {
    ScriptedSource::new(fixture_metadata(), fixture_plays())
}

/// Scripted prediction keyed by the fixture's game clock, with the
/// built-in model explaining.
pub fn fixture_ports() -> PortSet {
    let prediction = FnPrediction::new(|features| {
        let secs = features.get("game_seconds_remaining").unwrap_or(0.0) as u32;
        match secs {
            3600 => Ok(FIXTURE_HOME_WP[0]),
            3594 => Ok(FIXTURE_HOME_WP[1]),
            3588 => Ok(FIXTURE_HOME_WP[2]),
            other => Err(PortError::Failure(format!("no scripted probability at {}s", other))),
        }
    });
    PortSet::new(Arc::new(prediction), Arc::new(LinearPorts))
}
