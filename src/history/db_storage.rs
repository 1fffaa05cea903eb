//! SQLite-backed history store.
//!
//! One connection behind a mutex, WAL journal. Multi-row writes (a play with
//! its raw payload, a prediction with its attributions) each run in a single
//! transaction so readers never observe half of one.

use super::{HistoryQuery, NewRun, RunRecord, RunScope};
use crate::models::{
    rank_attributions, Attribution, Direction, Game, GameStatus, HistoryRecord, NewGame, Play,
    PredictionRecord, RawPlay,
};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Row};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS games (
    id TEXT PRIMARY KEY,
    home_team TEXT NOT NULL,
    away_team TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'scheduled',
    external_id TEXT,
    home_score INTEGER NOT NULL DEFAULT 0,
    away_score INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    game_id TEXT NOT NULL REFERENCES games(id),
    token INTEGER NOT NULL,
    speed REAL,
    mode TEXT NOT NULL,
    model_version TEXT NOT NULL,
    started_at TEXT NOT NULL,
    ended_at TEXT,
    outcome TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_game ON runs(game_id, started_at DESC);

CREATE TABLE IF NOT EXISTS plays (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    game_id TEXT NOT NULL REFERENCES games(id),
    run_id TEXT NOT NULL REFERENCES runs(id),
    sequence INTEGER NOT NULL,
    quarter INTEGER NOT NULL,
    clock_seconds INTEGER NOT NULL,
    game_seconds_remaining INTEGER,
    down INTEGER,
    yards_to_go INTEGER,
    yardline_from_own INTEGER,
    score_home INTEGER NOT NULL,
    score_away INTEGER NOT NULL,
    play_type TEXT,
    description TEXT,
    posteam TEXT,
    created_at TEXT NOT NULL,
    UNIQUE (game_id, sequence)
);

CREATE INDEX IF NOT EXISTS idx_plays_run ON plays(run_id, sequence);

CREATE TABLE IF NOT EXISTS play_raw (
    play_id INTEGER PRIMARY KEY REFERENCES plays(id),
    payload_json TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS predictions (
    play_id INTEGER PRIMARY KEY REFERENCES plays(id),
    model_version TEXT NOT NULL,
    home_wp REAL,
    away_wp REAL,
    degraded INTEGER NOT NULL DEFAULT 0,
    degraded_reason TEXT,
    predicted_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attributions (
    play_id INTEGER NOT NULL REFERENCES predictions(play_id),
    rank INTEGER NOT NULL,
    feature TEXT NOT NULL,
    value REAL NOT NULL,
    direction TEXT NOT NULL,
    display_name TEXT NOT NULL,
    PRIMARY KEY (play_id, rank)
) WITHOUT ROWID;
"#;

pub struct HistoryStore {
    conn: Arc<Mutex<Connection>>,
}

impl HistoryStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let journal_mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap_or_default();
        if db_path != ":memory:" && journal_mode.to_lowercase() != "wal" {
            warn!("WAL mode not active, journal_mode = {}", journal_mode);
        }

        let games: i64 = conn
            .query_row("SELECT COUNT(*) FROM games", [], |row| row.get(0))
            .unwrap_or(0);
        info!(db_path, games, "History store initialized");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn in_memory() -> Result<Self> {
        Self::new(":memory:")
    }

    pub fn ping(&self) -> bool {
        let conn = self.conn.lock();
        conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0)).is_ok()
    }

    // ---- games ----

    /// Insert the game, or refresh its team names on conflict. Status and
    /// score of an existing game are left alone.
    pub fn upsert_game(&self, game: &NewGame) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO games (id, home_team, away_team, status, external_id, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'scheduled', ?4, ?5, ?5)
             ON CONFLICT(id) DO UPDATE SET
                home_team = excluded.home_team,
                away_team = excluded.away_team,
                external_id = COALESCE(excluded.external_id, games.external_id),
                updated_at = excluded.updated_at",
            params![&game.id, &game.home_team, &game.away_team, &game.external_id, &now],
        )
        .with_context(|| format!("Failed to upsert game {}", game.id))?;
        Ok(())
    }

    pub fn get_game(&self, game_id: &str) -> Result<Option<Game>> {
        let conn = self.conn.lock();
        let game = conn
            .query_row(
                "SELECT id, home_team, away_team, status, external_id, home_score, away_score,
                        created_at, updated_at
                 FROM games WHERE id = ?1",
                params![game_id],
                Self::row_to_game,
            )
            .optional()?;
        Ok(game)
    }

    pub fn list_games(&self, status: Option<GameStatus>) -> Result<Vec<Game>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, home_team, away_team, status, external_id, home_score, away_score,
                    created_at, updated_at
             FROM games
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY updated_at DESC, id",
        )?;
        let games = stmt
            .query_map(params![status.map(|s| s.as_str())], Self::row_to_game)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(games)
    }

    /// Returns false when the game does not exist.
    pub fn set_game_status(&self, game_id: &str, status: GameStatus) -> Result<bool> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE games SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![game_id, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(changed > 0)
    }

    // ---- runs ----

    pub fn begin_run(&self, run: &NewRun) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO runs (id, game_id, token, speed, mode, model_version, started_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                &run.id,
                &run.game_id,
                run.token as i64,
                run.speed.filter(|s| s.is_finite()),
                &run.mode,
                &run.model_version,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to record run {}", run.id))?;
        Ok(())
    }

    pub fn finish_run(&self, run_id: &str, outcome: &str) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "UPDATE runs SET ended_at = ?2, outcome = ?3 WHERE id = ?1 AND ended_at IS NULL",
            params![run_id, Utc::now().to_rfc3339(), outcome],
        )?;
        Ok(())
    }

    pub fn latest_run_id(&self, game_id: &str) -> Result<Option<String>> {
        let conn = self.conn.lock();
        Self::latest_run_id_locked(&conn, game_id)
    }

    fn latest_run_id_locked(conn: &Connection, game_id: &str) -> Result<Option<String>> {
        let run_id = conn
            .query_row(
                "SELECT id FROM runs WHERE game_id = ?1 ORDER BY rowid DESC LIMIT 1",
                params![game_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(run_id)
    }

    /// Runs of a game, newest first.
    pub fn list_runs(&self, game_id: &str) -> Result<Vec<RunRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, game_id, token, speed, mode, model_version, started_at, ended_at, outcome
             FROM runs WHERE game_id = ?1 ORDER BY rowid DESC",
        )?;
        let runs = stmt
            .query_map(params![game_id], |row| {
                Ok(RunRecord {
                    id: row.get(0)?,
                    game_id: row.get(1)?,
                    token: row.get::<_, i64>(2)? as u64,
                    speed: row.get(3)?,
                    mode: row.get(4)?,
                    model_version: row.get(5)?,
                    started_at: row.get(6)?,
                    ended_at: row.get(7)?,
                    outcome: row.get(8)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(runs)
    }

    // ---- plays and predictions ----

    /// Highest sequence ever written for the game, 0 when none.
    pub fn max_sequence(&self, game_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let max: i64 = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) FROM plays WHERE game_id = ?1",
            params![game_id],
            |row| row.get(0),
        )?;
        Ok(max as u64)
    }

    pub fn play_count(&self, game_id: &str) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM plays WHERE game_id = ?1",
            params![game_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Write the play, its raw payload and the game's running score in one
    /// transaction. Returns the play row id.
    pub fn insert_play(&self, game_id: &str, run_id: &str, play: &Play, raw: &RawPlay) -> Result<i64> {
        let payload_json = serde_json::to_string(raw)?;
        let now = Utc::now().to_rfc3339();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO plays
             (game_id, run_id, sequence, quarter, clock_seconds, game_seconds_remaining, down,
              yards_to_go, yardline_from_own, score_home, score_away, play_type, description,
              posteam, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                game_id,
                run_id,
                play.sequence as i64,
                play.quarter,
                play.clock_seconds,
                raw.game_seconds_remaining,
                play.down,
                play.yards_to_go,
                play.yardline_from_own,
                play.score_home,
                play.score_away,
                &play.play_type,
                &play.description,
                &play.posteam,
                &now,
            ],
        )
        .with_context(|| format!("Failed to insert play {} of {}", play.sequence, game_id))?;
        let play_id = tx.last_insert_rowid();

        tx.execute(
            "INSERT INTO play_raw (play_id, payload_json) VALUES (?1, ?2)",
            params![play_id, payload_json],
        )?;
        tx.execute(
            "UPDATE games SET home_score = ?2, away_score = ?3, updated_at = ?4 WHERE id = ?1",
            params![game_id, play.score_home, play.score_away, &now],
        )?;
        tx.commit()?;

        debug!(game_id, sequence = play.sequence, play_id, "Play stored");
        Ok(play_id)
    }

    /// Write the prediction and its attributions in one transaction. A play
    /// has at most one prediction; a second write for it fails.
    pub fn insert_prediction(&self, play_id: i64, record: &PredictionRecord) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let exists: Option<i64> = tx
            .query_row("SELECT id FROM plays WHERE id = ?1", params![play_id], |row| row.get(0))
            .optional()?;
        if exists.is_none() {
            bail!("play {} does not exist", play_id);
        }

        tx.execute(
            "INSERT INTO predictions
             (play_id, model_version, home_wp, away_wp, degraded, degraded_reason, predicted_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                play_id,
                &record.model_version,
                record.home_wp,
                record.away_wp,
                record.degraded,
                &record.degraded_reason,
                Utc::now().to_rfc3339(),
            ],
        )
        .with_context(|| format!("Failed to insert prediction for play {}", play_id))?;

        {
            let mut stmt = tx.prepare_cached(
                "INSERT INTO attributions (play_id, rank, feature, value, direction, display_name)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (rank, attr) in record.attributions.iter().enumerate() {
                stmt.execute(params![
                    play_id,
                    rank as i64,
                    &attr.feature,
                    attr.value,
                    attr.direction.as_str(),
                    &attr.display_name,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    /// Plays of a game joined with their predictions, ordered by sequence.
    /// A play whose prediction was never written comes back with no
    /// probability and `degraded` set.
    pub fn history(&self, game_id: &str, query: &HistoryQuery) -> Result<Vec<HistoryRecord>> {
        let conn = self.conn.lock();

        let run_filter = match &query.scope {
            RunScope::LatestRun => match Self::latest_run_id_locked(&conn, game_id)? {
                Some(run_id) => Some(run_id),
                None => return Ok(Vec::new()),
            },
            RunScope::AllRuns => None,
            RunScope::Run(run_id) => Some(run_id.clone()),
        };
        let after = query.after_sequence.map(|s| s as i64).unwrap_or(-1);

        let mut stmt = conn.prepare_cached(
            "SELECT p.id, p.run_id, p.sequence, p.quarter, p.clock_seconds, p.score_home,
                    p.score_away, p.down, p.yards_to_go, p.yardline_from_own, p.play_type,
                    p.description, p.posteam, p.created_at,
                    pr.home_wp, pr.away_wp, pr.model_version, pr.degraded
             FROM plays p
             LEFT JOIN predictions pr ON pr.play_id = p.id
             WHERE p.game_id = ?1 AND p.sequence > ?2 AND (?3 IS NULL OR p.run_id = ?3)
             ORDER BY p.sequence",
        )?;
        let rows = stmt
            .query_map(params![game_id, after, run_filter], |row| {
                let play_id: i64 = row.get(0)?;
                let model_version: Option<String> = row.get(16)?;
                let degraded: Option<bool> = row.get(17)?;
                let record = HistoryRecord {
                    run_id: row.get(1)?,
                    play: Play {
                        sequence: row.get::<_, i64>(2)? as u64,
                        quarter: row.get(3)?,
                        clock_seconds: row.get(4)?,
                        score_home: row.get(5)?,
                        score_away: row.get(6)?,
                        down: row.get(7)?,
                        yards_to_go: row.get(8)?,
                        yardline_from_own: row.get(9)?,
                        play_type: row.get(10)?,
                        description: row.get(11)?,
                        posteam: row.get(12)?,
                    },
                    created_at: row.get(13)?,
                    home_win_probability: row.get(14)?,
                    away_win_probability: row.get(15)?,
                    degraded: degraded.unwrap_or(true) || model_version.is_none(),
                    model_version,
                    top_attributions: Vec::new(),
                };
                Ok((play_id, record))
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut attr_stmt = conn.prepare_cached(
            "SELECT feature, value, direction, display_name
             FROM attributions WHERE play_id = ?1 ORDER BY rank",
        )?;
        let mut history = Vec::with_capacity(rows.len());
        for (play_id, mut record) in rows {
            let mut attributions = attr_stmt
                .query_map(params![play_id], |row| {
                    let direction: String = row.get(2)?;
                    Ok(Attribution {
                        feature: row.get(0)?,
                        value: row.get(1)?,
                        direction: if direction == "negative" {
                            Direction::Negative
                        } else {
                            Direction::Positive
                        },
                        display_name: row.get(3)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rank_attributions(&mut attributions);
            record.top_attributions = attributions;
            history.push(record);
        }
        Ok(history)
    }

    fn row_to_game(row: &Row<'_>) -> rusqlite::Result<Game> {
        let status: String = row.get(3)?;
        let status = status.parse::<GameStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, e.into())
        })?;
        Ok(Game {
            id: row.get(0)?,
            home_team: row.get(1)?,
            away_team: row.get(2)?,
            status,
            external_id: row.get(4)?,
            home_score: row.get(5)?,
            away_score: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
        })
    }

    /// Make every later prediction write fail.
    #[cfg(test)]
    pub(crate) fn break_writes(&self) {
        let conn = self.conn.lock();
        conn.execute_batch("DROP TABLE attributions; DROP TABLE predictions;")
            .ok();
    }
}
