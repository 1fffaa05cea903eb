//! Durable play and prediction history.

pub mod db_storage;

use serde::{Deserialize, Serialize};

pub use db_storage::HistoryStore;

/// Which runs a history read covers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunScope {
    /// Only the most recently started run of the game.
    #[default]
    LatestRun,
    AllRuns,
    Run(String),
}

impl RunScope {
    /// `latest`, `all`, or a run id.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") | Some("latest") => RunScope::LatestRun,
            Some("all") => RunScope::AllRuns,
            Some(run_id) => RunScope::Run(run_id.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryQuery {
    pub scope: RunScope,
    /// Only rows with a sequence strictly greater than this.
    pub after_sequence: Option<u64>,
}

/// Fields recorded when a run starts.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub id: String,
    pub game_id: String,
    pub token: u64,
    pub speed: Option<f64>,
    pub mode: String,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub game_id: String,
    pub token: u64,
    pub speed: Option<f64>,
    pub mode: String,
    pub model_version: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub outcome: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_scope_parse() {
        assert_eq!(RunScope::parse(None), RunScope::LatestRun);
        assert_eq!(RunScope::parse(Some("latest")), RunScope::LatestRun);
        assert_eq!(RunScope::parse(Some("all")), RunScope::AllRuns);
        assert_eq!(
            RunScope::parse(Some("6f1c")),
            RunScope::Run("6f1c".to_string())
        );
    }
}
