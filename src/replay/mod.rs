//! Run scheduling: one paced or live run per game, each in its own task.

mod error;
pub mod orchestrator;
pub mod pacing;
pub mod run_state;

pub use error::ReplayError;
pub use orchestrator::{ReplayOrchestrator, StartedRun, StopReceipt};
pub use pacing::{validate_speed, PacingConfig, MIN_SPEED};
pub use run_state::{ActiveRun, RunSnapshot};
