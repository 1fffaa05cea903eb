use super::{ApiError, AppState};
use crate::history::{HistoryQuery, RunScope};
use crate::models::{Game, GameStatus};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct GamesQuery {
    pub status: Option<String>,
}

pub async fn list_games(
    State(state): State<AppState>,
    Query(query): Query<GamesQuery>,
) -> Result<Json<Vec<Game>>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(str::parse::<GameStatus>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    Ok(Json(state.store.list_games(status)?))
}

pub async fn get_game(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let game = state
        .store
        .get_game(&game_id)?
        .ok_or_else(|| ApiError::NotFound(format!("game {} not found", game_id)))?;
    let play_count = state.store.play_count(&game_id)?;
    let runs = state.store.list_runs(&game_id)?;
    let active_run = state.orchestrator.active_run(&game_id);

    Ok(Json(json!({
        "game": game,
        "play_count": play_count,
        "active": active_run.is_some(),
        "active_run": active_run,
        "runs": runs,
    })))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    /// `latest` (default), `all`, or a run id.
    pub run: Option<String>,
    /// Only plays with a greater sequence.
    pub after: Option<u64>,
}

/// Ordered play and win-probability history. A stream client that missed
/// messages passes the last sequence it saw as `after`.
pub async fn wp_history(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Value>, ApiError> {
    if state.store.get_game(&game_id)?.is_none() {
        return Err(ApiError::NotFound(format!("game {} not found", game_id)));
    }
    let query = HistoryQuery {
        scope: RunScope::parse(params.run.as_deref()),
        after_sequence: params.after,
    };
    let history = state.store.history(&game_id, &query)?;

    Ok(Json(json!({
        "game_id": game_id,
        "count": history.len(),
        "history": history,
    })))
}
