//! Built-in logistic win-probability model.
//!
//! Both ports are served from the same coefficients: the probability is
//! `sigmoid(intercept + Σ coef·x)` and the attribution of a feature is its
//! exact log-odds contribution relative to a baseline, `coef·(x − baseline)`.

use super::{AttributionPort, ModelHandle, Prediction, PredictionPort, PortError};
use crate::features::{feature_index, FeatureVector, FEATURES, FEATURE_COUNT};
use crate::models::{rank_attributions, Attribution};
use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq)]
pub struct LinearWinModel {
    pub name: String,
    pub intercept: f64,
    pub coefficients: [f64; FEATURE_COUNT],
    pub baselines: [f64; FEATURE_COUNT],
}

/// On-disk TOML form. Features not listed get a zero coefficient and their
/// fill value as baseline.
#[derive(Debug, Deserialize)]
struct ModelFile {
    name: String,
    #[serde(default)]
    intercept: f64,
    #[serde(default)]
    coefficients: BTreeMap<String, f64>,
    #[serde(default)]
    baselines: BTreeMap<String, f64>,
}

impl LinearWinModel {
    /// Hand-tuned reference coefficients (home perspective).
    pub fn reference() -> Self {
        let mut coefficients = [0.0; FEATURE_COUNT];
        for (name, coef) in [
            ("down", -0.04),
            ("yards_to_go", -0.01),
            ("yardline_100", -0.006),
            ("score_differential", 0.035),
            ("posteam_is_home", 0.25),
            ("posteam_timeouts_remaining", 0.03),
            ("defteam_timeouts_remaining", -0.03),
            ("receive_2h_ko", 0.05),
            ("spread_line", 0.02),
            ("spread_time", 0.09),
            ("diff_time_ratio", 0.18),
            ("ep", 0.04),
        ] {
            if let Some(i) = feature_index(name) {
                coefficients[i] = coef;
            }
        }

        Self {
            name: "wp-linear-ref".to_string(),
            intercept: 0.3,
            coefficients,
            baselines: FEATURES.map(|f| f.fill),
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let file: ModelFile = toml::from_str(contents).context("Invalid model definition")?;
        let mut coefficients = [0.0; FEATURE_COUNT];
        let mut baselines = FEATURES.map(|f| f.fill);

        for (name, coef) in &file.coefficients {
            let Some(i) = feature_index(name) else {
                bail!("unknown feature '{}' in coefficients", name);
            };
            coefficients[i] = *coef;
        }
        for (name, base) in &file.baselines {
            let Some(i) = feature_index(name) else {
                bail!("unknown feature '{}' in baselines", name);
            };
            baselines[i] = *base;
        }

        Ok(Self {
            name: file.name,
            intercept: file.intercept,
            coefficients,
            baselines,
        })
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read model definition {}", path.display()))?;
        Self::from_toml(&contents)
    }

    pub fn log_odds(&self, features: &FeatureVector) -> f64 {
        self.intercept
            + self
                .coefficients
                .iter()
                .zip(features.values().iter())
                .map(|(c, x)| c * x)
                .sum::<f64>()
    }

    pub fn home_win_probability(&self, features: &FeatureVector) -> f64 {
        1.0 / (1.0 + (-self.log_odds(features)).exp())
    }

    pub fn contributions(&self, features: &FeatureVector) -> Vec<Attribution> {
        features
            .iter()
            .enumerate()
            .filter(|(i, _)| self.coefficients[*i] != 0.0)
            .map(|(i, (def, x))| {
                Attribution::new(
                    def.name,
                    self.coefficients[i] * (x - self.baselines[i]),
                    def.display_name,
                )
            })
            .collect()
    }
}

/// Port adapter that evaluates whatever linear model the handle carries.
pub struct LinearPorts;

#[async_trait::async_trait]
impl PredictionPort for LinearPorts {
    async fn predict(&self, model: &ModelHandle, features: &FeatureVector) -> Result<Prediction, PortError> {
        let p = model.model.home_win_probability(features);
        if !p.is_finite() {
            return Err(PortError::Failure("non-finite probability".to_string()));
        }
        Ok(Prediction {
            home_wp: p,
            model_version: model.version.name.clone(),
        })
    }
}

#[async_trait::async_trait]
impl AttributionPort for LinearPorts {
    async fn explain(
        &self,
        model: &ModelHandle,
        features: &FeatureVector,
        top_n: usize,
    ) -> Result<Vec<Attribution>, PortError> {
        let mut attributions = model.model.contributions(features);
        rank_attributions(&mut attributions);
        attributions.truncate(top_n);
        Ok(attributions)
    }
}
