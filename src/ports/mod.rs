//! Prediction and attribution ports.
//!
//! The orchestrator sees the model only through these two traits and an
//! explicit [`ModelHandle`]. A run takes one handle when it starts and passes
//! it to every call, so a reload never mixes versions inside a run.

pub mod linear;

use crate::features::FeatureVector;
use crate::models::Attribution;
use anyhow::Result;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

pub use linear::{LinearPorts, LinearWinModel};

/// Number of attributions kept per play.
pub const TOP_ATTRIBUTIONS: usize = 5;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortError {
    Timeout { operation: &'static str, after: Duration },
    Failure(String),
}

impl fmt::Display for PortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortError::Timeout { operation, after } => {
                write!(f, "{} timed out after {}ms", operation, after.as_millis())
            }
            PortError::Failure(msg) => write!(f, "port failure: {}", msg),
        }
    }
}

impl std::error::Error for PortError {}

#[derive(Debug, Clone, Serialize)]
pub struct ModelVersion {
    pub id: String,
    pub name: String,
    pub loaded_at: DateTime<Utc>,
}

/// Versioned, immutable model handle.
#[derive(Debug)]
pub struct ModelHandle {
    pub version: ModelVersion,
    pub model: LinearWinModel,
}

impl ModelHandle {
    pub fn new(model: LinearWinModel) -> Self {
        Self {
            version: ModelVersion {
                id: uuid::Uuid::new_v4().to_string(),
                name: model.name.clone(),
                loaded_at: Utc::now(),
            },
            model,
        }
    }

    pub fn version_name(&self) -> &str {
        &self.version.name
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub home_wp: f64,
    pub model_version: String,
}

#[async_trait::async_trait]
pub trait PredictionPort: Send + Sync {
    async fn predict(&self, model: &ModelHandle, features: &FeatureVector) -> Result<Prediction, PortError>;
}

#[async_trait::async_trait]
pub trait AttributionPort: Send + Sync {
    /// Ranked attributions, largest absolute contribution first.
    async fn explain(
        &self,
        model: &ModelHandle,
        features: &FeatureVector,
        top_n: usize,
    ) -> Result<Vec<Attribution>, PortError>;
}

/// The two ports the orchestrator drives for every play.
#[derive(Clone)]
pub struct PortSet {
    pub prediction: Arc<dyn PredictionPort>,
    pub attribution: Arc<dyn AttributionPort>,
}

impl PortSet {
    pub fn new(prediction: Arc<dyn PredictionPort>, attribution: Arc<dyn AttributionPort>) -> Self {
        Self {
            prediction,
            attribution,
        }
    }

    /// Both ports backed by the built-in linear model.
    pub fn linear() -> Self {
        let ports = Arc::new(LinearPorts);
        Self {
            prediction: ports.clone(),
            attribution: ports,
        }
    }
}

/// Timeout and retry bounds for one port call.
#[derive(Debug, Clone)]
pub struct PortPolicy {
    pub timeout: Duration,
    pub max_retries: u32,
    pub base_backoff: Duration,
    pub jitter_factor: f64,
}

impl Default for PortPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            max_retries: 2,
            base_backoff: Duration::from_millis(50),
            jitter_factor: 0.3,
        }
    }
}

impl PortPolicy {
    fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.base_backoff.as_secs_f64() * 2f64.powi(attempt as i32);
        let jitter_range = base * self.jitter_factor;
        let jitter = if jitter_range > 0.0 {
            rand::thread_rng().gen_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_secs_f64((base + jitter).max(0.0))
    }
}

/// Run a port call under the policy's timeout, retrying with exponential
/// backoff. Returns the last error once retries are exhausted.
pub async fn call_port<F, Fut, T>(
    policy: &PortPolicy,
    operation: &'static str,
    game_id: &str,
    mut call: F,
) -> Result<T, PortError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PortError>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.timeout, call()).await {
            Ok(r) => r,
            Err(_) => Err(PortError::Timeout {
                operation,
                after: policy.timeout,
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_retries => {
                let delay = policy.backoff_for_attempt(attempt);
                warn!(
                    game_id,
                    operation,
                    attempt = attempt + 1,
                    max_attempts = policy.max_retries + 1,
                    error = %e,
                    "Port call failed, retrying in {:?}",
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Holds the current model handle. Swapping is lock-free; readers get an
/// `Arc` that stays valid for as long as they hold it.
pub struct ModelRegistry {
    current: ArcSwap<ModelHandle>,
    model_path: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn new(model: LinearWinModel) -> Self {
        Self {
            current: ArcSwap::from_pointee(ModelHandle::new(model)),
            model_path: None,
        }
    }

    /// Load from `model_path` when given, else the built-in reference model.
    pub fn from_path(model_path: Option<PathBuf>) -> Result<Self> {
        let model = match &model_path {
            Some(path) => LinearWinModel::load(path)?,
            None => LinearWinModel::reference(),
        };
        info!(model = %model.name, "Model loaded");
        Ok(Self {
            current: ArcSwap::from_pointee(ModelHandle::new(model)),
            model_path,
        })
    }

    pub fn current(&self) -> Arc<ModelHandle> {
        self.current.load_full()
    }

    pub fn install(&self, model: LinearWinModel) -> Arc<ModelHandle> {
        let handle = Arc::new(ModelHandle::new(model));
        self.current.store(handle.clone());
        info!(
            model = %handle.version.name,
            version_id = %handle.version.id,
            "Model handle installed"
        );
        handle
    }

    /// Re-read the model definition file. Runs already in flight keep the
    /// handle they started with.
    pub fn reload(&self) -> Result<Arc<ModelHandle>> {
        let model = match &self.model_path {
            Some(path) => LinearWinModel::load(path)?,
            None => LinearWinModel::reference(),
        };
        Ok(self.install(model))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_policy(max_retries: u32) -> PortPolicy {
        PortPolicy {
            timeout: Duration::from_millis(50),
            max_retries,
            base_backoff: Duration::from_millis(1),
            jitter_factor: 0.0,
        }
    }

    #[tokio::test]
    async fn test_call_port_retries_then_succeeds() {
        let attempts = AtomicU32::new(0);
        let result = call_port(&fast_policy(2), "predict", "g1", || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(PortError::Failure("flaky".to_string()))
                } else {
                    Ok(0.5)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(0.5));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_call_port_gives_up_after_bound() {
        let attempts = AtomicU32::new(0);
        let result: Result<f64, _> = call_port(&fast_policy(1), "explain", "g1", || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(PortError::Failure("down".to_string())) }
        })
        .await;

        assert!(matches!(result, Err(PortError::Failure(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_call_port_times_out() {
        let result: Result<f64, _> = call_port(&fast_policy(0), "predict", "g1", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1.0)
        })
        .await;

        assert!(matches!(result, Err(PortError::Timeout { operation: "predict", .. })));
    }

    #[test]
    fn test_reload_keeps_old_handles_valid() {
        let registry = ModelRegistry::new(LinearWinModel::reference());
        let before = registry.current();

        let mut retrained = LinearWinModel::reference();
        retrained.name = "wp-linear-v2".to_string();
        registry.install(retrained);

        assert_eq!(before.version_name(), LinearWinModel::reference().name);
        assert_eq!(registry.current().version_name(), "wp-linear-v2");
        assert_ne!(before.version.id, registry.current().version.id);
    }
}
