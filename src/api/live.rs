//! Live feed control: open a feed for a game, push plays into it, close it.

use super::{ApiError, AppState};
use crate::models::RawPlay;
use crate::source::{LiveFeedSource, SourceMetadata};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub struct LiveStartQuery {
    pub home: String,
    pub away: String,
    pub external_id: Option<String>,
}

pub async fn start_live(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Query(query): Query<LiveStartQuery>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if query.home.trim().is_empty() || query.away.trim().is_empty() {
        return Err(ApiError::BadRequest("home and away are required".to_string()));
    }

    let (handle, source) = LiveFeedSource::channel(SourceMetadata {
        home_team: query.home.trim().to_string(),
        away_team: query.away.trim().to_string(),
        external_id: query.external_id,
        total_plays: None,
    });
    let started = state
        .orchestrator
        .start(&game_id, Box::new(source), f64::INFINITY)?;
    state.live_feeds.register(&game_id, handle);

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({
            "status": "started",
            "game_id": game_id,
            "run_token": started.run_token,
            "run_id": started.run_id,
            "model_version": started.model_version,
            "mode": started.mode,
        })),
    ))
}

pub async fn push_play(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
    Json(play): Json<RawPlay>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let not_open = || ApiError::NotRunning(format!("no live feed open for game {}", game_id));
    let feed = state.live_feeds.get(&game_id).ok_or_else(not_open)?;
    feed.push(play).await.map_err(|_| not_open())?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "accepted" }))))
}

/// Closing ends the run normally once queued plays are processed.
pub async fn close_live(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    if !state.live_feeds.close(&game_id) {
        return Err(ApiError::NotRunning(format!(
            "no live feed open for game {}",
            game_id
        )));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "closing" }))))
}

#[cfg(test)]
mod tests {
    use crate::api::routes::tests::{json_body, send, test_state};
    use crate::history::{HistoryQuery, RunScope};
    use crate::models::GameStatus;
    use axum::http::StatusCode;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn test_live_feed_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = send(&state, "POST", "/api/live/g1/start?home=KC&away=CIN", None).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        assert_eq!(json_body(response).await["mode"], "live");

        let response = send(&state, "POST", "/api/live/g1/start?home=KC&away=CIN", None).await;
        assert_eq!(response.status(), StatusCode::CONFLICT);

        for (secs, score_home) in [(3600, 0), (3540, 7)] {
            let play = json!({
                "quarter": 1,
                "clock_seconds": secs - 2700,
                "game_seconds_remaining": secs,
                "score_home": score_home,
                "posteam": "KC",
                "posteam_is_home": true,
            });
            let response = send(&state, "POST", "/api/live/g1/plays", Some(play)).await;
            assert_eq!(response.status(), StatusCode::ACCEPTED);
        }

        let response = send(&state, "POST", "/api/live/g1/close", None).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        for _ in 0..200 {
            if !state.orchestrator.is_active("g1") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let game = state.store.get_game("g1").unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Final);
        assert_eq!(game.home_score, 7);

        let history = state
            .store
            .history(
                "g1",
                &HistoryQuery {
                    scope: RunScope::LatestRun,
                    after_sequence: None,
                },
            )
            .unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|r| r.home_win_probability.is_some()));
    }

    #[tokio::test]
    async fn test_push_without_feed_is_404() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        let response = send(&state, "POST", "/api/live/g9/plays", Some(json!({ "quarter": 1 }))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(&state, "POST", "/api/live/g9/close", None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_stopped_live_run_rejects_plays() {
        let dir = tempfile::tempdir().unwrap();
        let state = test_state(dir.path());

        send(&state, "POST", "/api/live/g1/start?home=KC&away=CIN", None).await;
        let response = send(&state, "POST", "/api/replay/g1/stop", None).await;
        assert_eq!(response.status(), StatusCode::ACCEPTED);

        // The run task drops the feed's reader when it observes the stop.
        let mut status = StatusCode::ACCEPTED;
        for _ in 0..200 {
            let response = send(&state, "POST", "/api/live/g1/plays", Some(json!({ "quarter": 1 }))).await;
            status = response.status();
            if status == StatusCode::NOT_FOUND {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
