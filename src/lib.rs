//! ClutchFactor backend library
//!
//! Replays and live-follows NFL games play by play, scores every play with a
//! win-probability model, stores the history and streams updates to
//! subscribers. The binaries wire these modules together.

pub mod api;
pub mod config;
pub mod features;
pub mod history;
pub mod middleware;
pub mod models;
pub mod ports;
pub mod replay;
pub mod source;
pub mod stream;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use api::{build_router, AppState};
pub use config::{AppConfig, ServerArgs};
