//! Event sources: ordered play streams for one game.
//!
//! A paced source is replayable history; the orchestrator spaces its plays
//! by their declared timestamps. A live source yields plays as they arrive
//! and is never paced.

pub mod csv_replay;
pub mod live;

use crate::models::RawPlay;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

pub use csv_replay::{resolve_replay_file, CsvReplaySource};
pub use live::{LiveFeedHandle, LiveFeedRegistry, LiveFeedSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    Paced,
    Live,
}

impl SourceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceMode::Paced => "paced",
            SourceMode::Live => "live",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceMetadata {
    pub home_team: String,
    pub away_team: String,
    pub external_id: Option<String>,
    pub total_plays: Option<usize>,
}

#[async_trait::async_trait]
pub trait EventSource: Send {
    fn metadata(&self) -> &SourceMetadata;

    fn mode(&self) -> SourceMode;

    /// Next play in source order, `None` once exhausted.
    async fn next_play(&mut self) -> Result<Option<RawPlay>>;
}

/// In-memory source over a fixed list of plays.
pub struct ScriptedSource {
    metadata: SourceMetadata,
    plays: VecDeque<RawPlay>,
    mode: SourceMode,
    fail_after: Option<usize>,
    yielded: usize,
}

impl ScriptedSource {
    pub fn new(metadata: SourceMetadata, plays: Vec<RawPlay>) -> Self {
        Self {
            metadata: SourceMetadata {
                total_plays: Some(plays.len()),
                ..metadata
            },
            plays: plays.into(),
            mode: SourceMode::Paced,
            fail_after: None,
            yielded: 0,
        }
    }

    pub fn live(mut self) -> Self {
        self.mode = SourceMode::Live;
        self
    }

    /// Return an error instead of the play after `n` plays were yielded.
    pub fn failing_after(mut self, n: usize) -> Self {
        self.fail_after = Some(n);
        self
    }
}

#[async_trait::async_trait]
impl EventSource for ScriptedSource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn mode(&self) -> SourceMode {
        self.mode
    }

    async fn next_play(&mut self) -> Result<Option<RawPlay>> {
        if self.fail_after == Some(self.yielded) {
            anyhow::bail!("scripted source failure after {} plays", self.yielded);
        }
        let next = self.plays.pop_front();
        if next.is_some() {
            self.yielded += 1;
        }
        Ok(next)
    }
}
