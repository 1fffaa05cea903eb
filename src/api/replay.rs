//! Replay control: start, stop, and list active runs.

use super::{ApiError, AppState};
use crate::replay::RunSnapshot;
use crate::source::{resolve_replay_file, CsvReplaySource};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    /// CSV file name inside the replay data directory.
    #[serde(alias = "csv_filename")]
    pub source: String,
    /// Game id inside the CSV, e.g. `2022_20_CIN_KC`.
    #[serde(alias = "nflfastr_game_id")]
    pub external_id: String,
    #[serde(default = "default_speed")]
    pub speed: f64,
}

fn default_speed() -> f64 {
    1.0
}

pub async fn start_replay(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Query(query): Query<StartQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !(query.speed >= state.config.min_speed && query.speed <= state.config.max_speed) {
        return Err(ApiError::BadRequest(format!(
            "speed must be in [{}, {}]",
            state.config.min_speed, state.config.max_speed
        )));
    }
    // Cheap rejection before reading a season file; start() re-checks atomically.
    if state.orchestrator.is_active(&game_id) {
        return Err(ApiError::AlreadyRunning(format!(
            "a run is already active for game {}",
            game_id
        )));
    }

    let path = resolve_replay_file(&state.config.data_dir, &query.source)?;
    let external_id = query.external_id.clone();
    let source = tokio::task::spawn_blocking(move || CsvReplaySource::open(&path, &external_id))
        .await
        .map_err(|e| ApiError::Internal(format!("replay loader panicked: {}", e)))??;

    let started = state
        .orchestrator
        .start(&game_id, Box::new(source), query.speed)?;
    info!(
        game_id = %game_id,
        source = %query.source,
        external_id = %query.external_id,
        run_token = started.run_token,
        "Replay accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "game_id": game_id,
            "run_token": started.run_token,
            "run_id": started.run_id,
            "model_version": started.model_version,
            "source": query.source,
            "speed": query.speed,
        })),
    ))
}

pub async fn stop_replay(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let receipt = state.orchestrator.stop(&game_id)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "stopped",
            "game_id": game_id,
            "run_token": receipt.run_token,
            "run_id": receipt.run_id,
            "last_sequence": receipt.last_sequence,
        })),
    ))
}

pub async fn active_runs(State(state): State<AppState>) -> Json<Vec<RunSnapshot>> {
    Json(state.orchestrator.active_runs())
}
