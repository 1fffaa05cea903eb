//! Per-game broadcast and the stream sessions built on it.

pub mod gateway;
pub mod hub;

pub use gateway::{Frame, GatewaySession};
pub use hub::{BroadcastHub, DropReason, PublishReport, Subscription, DEFAULT_SUBSCRIBER_CAPACITY};

use crate::models::StreamEvent;
use tracing::warn;

/// Wire JSON for one message.
pub fn encode(event: &StreamEvent) -> String {
    serde_json::to_string(event).unwrap_or_else(|e| {
        warn!("Failed to serialize stream event: {}", e);
        "{}".to_string()
    })
}
