//! Push-based live feed.
//!
//! A [`LiveFeedHandle`] is the write end and [`LiveFeedSource`] the read end
//! of one bounded channel per game. Dropping or closing every handle
//! exhausts the source, which ends the run like a finished replay.

use super::{EventSource, SourceMetadata, SourceMode};
use crate::models::RawPlay;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info};

const LIVE_FEED_CAPACITY: usize = 256;

#[derive(Clone)]
pub struct LiveFeedHandle {
    tx: mpsc::Sender<RawPlay>,
}

impl LiveFeedHandle {
    /// Waits for room when the run is behind; a live feed must not drop plays.
    pub async fn push(&self, play: RawPlay) -> Result<()> {
        self.tx
            .send(play)
            .await
            .map_err(|_| anyhow::anyhow!("live feed closed"))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

pub struct LiveFeedSource {
    metadata: SourceMetadata,
    rx: mpsc::Receiver<RawPlay>,
}

impl LiveFeedSource {
    pub fn channel(metadata: SourceMetadata) -> (LiveFeedHandle, Self) {
        let (tx, rx) = mpsc::channel(LIVE_FEED_CAPACITY);
        (LiveFeedHandle { tx }, Self { metadata, rx })
    }
}

#[async_trait::async_trait]
impl EventSource for LiveFeedSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Live
    }

    async fn next_play(&mut self) -> Result<Option<RawPlay>> {
        Ok(self.rx.recv().await)
    }
}

/// Open live feeds by game id.
#[derive(Default)]
pub struct LiveFeedRegistry {
    feeds: Mutex<HashMap<String, LiveFeedHandle>>,
}

impl LiveFeedRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, game_id: &str, handle: LiveFeedHandle) {
        self.feeds.lock().insert(game_id.to_string(), handle);
        info!(game_id, "Live feed opened");
    }

    /// Handle for an open feed. Feeds whose run has gone away are pruned.
    pub fn get(&self, game_id: &str) -> Option<LiveFeedHandle> {
        let mut feeds = self.feeds.lock();
        match feeds.get(game_id) {
            Some(handle) if handle.is_closed() => {
                feeds.remove(game_id);
                debug!(game_id, "Pruned closed live feed");
                None
            }
            Some(handle) => Some(handle.clone()),
            None => None,
        }
    }

    /// Drop the registry's handle. The source is exhausted once in-flight
    /// pushes holding a clone finish.
    pub fn close(&self, game_id: &str) -> bool {
        let removed = self.feeds.lock().remove(game_id).is_some();
        if removed {
            info!(game_id, "Live feed closed");
        }
        removed
    }
}
