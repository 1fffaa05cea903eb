//! nflfastR play-by-play CSV replay.
//!
//! Loads one game's rows from a season file and normalises them into
//! [`RawPlay`]s. The declared timestamp of each play is the elapsed game
//! time, so pacing follows the game clock.

use super::{EventSource, SourceMetadata, SourceMode};
use crate::models::RawPlay;
use anyhow::Result;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::info;

const REGULATION_SECS: f64 = 3600.0;

#[derive(Debug)]
pub enum ReplayFileError {
    InvalidName(String),
    NotFound(PathBuf),
    Unreadable(String),
    NoPlays { external_id: String, path: PathBuf },
}

impl fmt::Display for ReplayFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplayFileError::InvalidName(name) => write!(f, "invalid replay file name '{}'", name),
            ReplayFileError::NotFound(path) => write!(f, "replay file not found: {}", path.display()),
            ReplayFileError::Unreadable(msg) => write!(f, "replay file unreadable: {}", msg),
            ReplayFileError::NoPlays { external_id, path } => write!(
                f,
                "no plays for game '{}' in {} (expected an nflfastR id such as 2022_20_CIN_KC)",
                external_id,
                path.display()
            ),
        }
    }
}

impl std::error::Error for ReplayFileError {}

/// Resolve a bare file name inside `data_dir`. Names with path components are
/// rejected so a request cannot escape the data directory.
pub fn resolve_replay_file(data_dir: &Path, name: &str) -> Result<PathBuf, ReplayFileError> {
    let trimmed = name.trim();
    if trimmed.is_empty()
        || trimmed.contains("..")
        || trimmed.contains('/')
        || trimmed.contains('\\')
    {
        return Err(ReplayFileError::InvalidName(name.to_string()));
    }
    let path = data_dir.join(trimmed);
    if !path.is_file() {
        return Err(ReplayFileError::NotFound(path));
    }
    Ok(path)
}

pub struct CsvReplaySource {
    metadata: SourceMetadata,
    plays: VecDeque<RawPlay>,
}

impl CsvReplaySource {
    /// Blocking: reads the whole file. Call from `spawn_blocking` in async code.
    pub fn open(path: &Path, external_id: &str) -> Result<Self, ReplayFileError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|e| ReplayFileError::Unreadable(e.to_string()))?;

        let headers = reader
            .headers()
            .map_err(|e| ReplayFileError::Unreadable(e.to_string()))?
            .clone();
        let columns: HashMap<&str, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h, i))
            .collect();
        let has_game_column = columns.contains_key("game_id");

        let mut plays = VecDeque::new();
        let mut home_team = None;
        let mut away_team = None;

        for record in reader.records() {
            let record = record.map_err(|e| ReplayFileError::Unreadable(e.to_string()))?;
            let row = Row {
                record: &record,
                columns: &columns,
            };
            if has_game_column && row.text("game_id").as_deref() != Some(external_id) {
                continue;
            }
            if home_team.is_none() {
                home_team = row.text("home_team");
                away_team = row.text("away_team");
            }
            if let Some(play) = row.to_play(&headers) {
                plays.push_back(play);
            }
        }

        if plays.is_empty() {
            return Err(ReplayFileError::NoPlays {
                external_id: external_id.to_string(),
                path: path.to_path_buf(),
            });
        }

        info!(
            path = %path.display(),
            external_id,
            plays = plays.len(),
            "Loaded replay plays"
        );

        Ok(Self {
            metadata: SourceMetadata {
                home_team: home_team.unwrap_or_else(|| "HOME".to_string()),
                away_team: away_team.unwrap_or_else(|| "AWAY".to_string()),
                external_id: Some(external_id.to_string()),
                total_plays: Some(plays.len()),
            },
            plays,
        })
    }
}

#[async_trait::async_trait]
impl EventSource for CsvReplaySource {
    fn metadata(&self) -> &SourceMetadata {
        &self.metadata
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Paced
    }

    async fn next_play(&mut self) -> Result<Option<RawPlay>> {
        Ok(self.plays.pop_front())
    }
}

struct Row<'a> {
    record: &'a csv::StringRecord,
    columns: &'a HashMap<&'a str, usize>,
}

impl Row<'_> {
    fn text(&self, column: &str) -> Option<String> {
        let idx = *self.columns.get(column)?;
        let value = self.record.get(idx)?.trim();
        if value.is_empty() || value == "NA" || value.eq_ignore_ascii_case("nan") {
            return None;
        }
        Some(value.to_string())
    }

    fn float(&self, column: &str) -> Option<f64> {
        self.text(column)?.parse::<f64>().ok().filter(|v| v.is_finite())
    }

    fn int(&self, column: &str) -> Option<i64> {
        self.float(column).map(|v| v as i64)
    }

    fn uint<T: TryFrom<i64>>(&self, column: &str) -> Option<T> {
        self.int(column).and_then(|v| T::try_from(v).ok())
    }

    /// `None` for rows without a game clock (end-of-game markers and the like).
    fn to_play(&self, headers: &csv::StringRecord) -> Option<RawPlay> {
        let game_secs: u32 = self.uint("game_seconds_remaining")?;

        let posteam = self.text("posteam");
        let home_team = self.text("home_team");
        let posteam_is_home = match (&posteam, &home_team) {
            (Some(p), Some(h)) => Some(p == h),
            _ => None,
        };
        let home_opening_kickoff = self.int("home_opening_kickoff").map(|v| v != 0);
        let receive_2h_ko = match (home_opening_kickoff, posteam_is_home) {
            (Some(hok), Some(home)) => Some(hok != home),
            _ => None,
        };

        let raw: serde_json::Map<String, serde_json::Value> = headers
            .iter()
            .zip(self.record.iter())
            .filter(|(_, v)| !v.is_empty() && *v != "NA")
            .map(|(h, v)| (h.to_string(), serde_json::Value::String(v.to_string())))
            .collect();

        Some(RawPlay {
            occurred_at_secs: Some((REGULATION_SECS - game_secs as f64).max(0.0)),
            quarter: self.uint("qtr").unwrap_or(1),
            clock_seconds: self.uint("quarter_seconds_remaining").unwrap_or(0),
            game_seconds_remaining: Some(game_secs),
            half_seconds_remaining: self.uint("half_seconds_remaining"),
            down: self.uint("down"),
            yards_to_go: self.uint("yards_to_go").or_else(|| self.uint("ydstogo")),
            yardline_100: self.uint("yardline_100"),
            score_home: self.int("total_home_score").unwrap_or(0),
            score_away: self.int("total_away_score").unwrap_or(0),
            posteam,
            defteam: self.text("defteam"),
            posteam_is_home,
            receive_2h_ko,
            posteam_timeouts_remaining: self.uint("posteam_timeouts_remaining"),
            defteam_timeouts_remaining: self.uint("defteam_timeouts_remaining"),
            spread_line: self.float("spread_line"),
            ep: self.float("ep"),
            play_type: self.text("play_type"),
            description: self.text("desc"),
            raw: serde_json::Value::Object(raw),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{tempdir, NamedTempFile};

    const SAMPLE: &str = "\
game_id,home_team,away_team,qtr,quarter_seconds_remaining,game_seconds_remaining,half_seconds_remaining,down,ydstogo,yardline_100,posteam,defteam,total_home_score,total_away_score,posteam_timeouts_remaining,defteam_timeouts_remaining,spread_line,ep,play_type,desc,home_opening_kickoff
2022_20_CIN_KC,KC,CIN,1,900,3600,1800,NA,0,35,CIN,KC,0,0,3,3,-1.5,0.8,kickoff,H.Butker kicks 65 yards,0
2022_20_CIN_KC,KC,CIN,1,893,3593,1793,1,10,75,CIN,KC,0,0,3,3,-1.5,0.5,run,J.Mixon right end for 7,0
2022_20_OTHER,BUF,MIA,1,900,3600,1800,NA,0,35,MIA,BUF,0,0,3,3,3.0,0.8,kickoff,other game,1
2022_20_CIN_KC,KC,CIN,4,0,NA,0,NA,0,NA,NA,NA,23,20,NA,NA,-1.5,NA,NA,END GAME,0
";

    fn sample_file() -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn test_loads_only_requested_game() {
        let file = sample_file();
        let mut source = CsvReplaySource::open(file.path(), "2022_20_CIN_KC").unwrap();

        assert_eq!(source.metadata().home_team, "KC");
        assert_eq!(source.metadata().away_team, "CIN");
        assert_eq!(source.metadata().total_plays, Some(2));

        let kickoff = source.next_play().await.unwrap().unwrap();
        assert_eq!(kickoff.play_type.as_deref(), Some("kickoff"));
        assert_eq!(kickoff.down, None);
        assert_eq!(kickoff.occurred_at_secs, Some(0.0));
        assert_eq!(kickoff.posteam_is_home, Some(false));
        assert_eq!(kickoff.receive_2h_ko, Some(false));

        let run = source.next_play().await.unwrap().unwrap();
        assert_eq!(run.yards_to_go, Some(10));
        assert_eq!(run.yardline_from_own(), Some(25));
        assert_eq!(run.occurred_at_secs, Some(7.0));
        assert_eq!(run.raw["desc"], "J.Mixon right end for 7");

        assert!(source.next_play().await.unwrap().is_none());
    }

    #[test]
    fn test_unknown_game_is_rejected() {
        let file = sample_file();
        let err = CsvReplaySource::open(file.path(), "1999_01_NOPE").err().unwrap();
        assert!(matches!(err, ReplayFileError::NoPlays { .. }));
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            resolve_replay_file(dir.path(), "../secrets.csv"),
            Err(ReplayFileError::InvalidName(_))
        ));
        assert!(matches!(
            resolve_replay_file(dir.path(), "nested/file.csv"),
            Err(ReplayFileError::InvalidName(_))
        ));
        assert!(matches!(
            resolve_replay_file(dir.path(), "missing.csv"),
            Err(ReplayFileError::NotFound(_))
        ));

        std::fs::write(dir.path().join("pbp.csv"), SAMPLE).unwrap();
        assert!(resolve_replay_file(dir.path(), "pbp.csv").is_ok());
    }
}
