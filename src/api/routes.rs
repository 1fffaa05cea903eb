//! Router and shared state for the control surface and stream endpoints.

use super::{games, live, models, replay, stream};
use crate::config::AppConfig;
use crate::history::HistoryStore;
use crate::middleware::request_logging;
use crate::ports::{ModelRegistry, PortSet};
use crate::replay::ReplayOrchestrator;
use crate::source::LiveFeedRegistry;
use crate::stream::BroadcastHub;
use axum::{
    extract::State,
    middleware,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<HistoryStore>,
    pub hub: Arc<BroadcastHub>,
    pub orchestrator: Arc<ReplayOrchestrator>,
    pub models: Arc<ModelRegistry>,
    pub live_feeds: Arc<LiveFeedRegistry>,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(config: AppConfig, store: HistoryStore, models: ModelRegistry, ports: PortSet) -> Self {
        let store = Arc::new(store);
        let hub = Arc::new(BroadcastHub::new(config.subscriber_queue_capacity));
        let models = Arc::new(models);
        let orchestrator = Arc::new(
            ReplayOrchestrator::new(store.clone(), hub.clone(), ports, models.clone())
                .with_pacing(config.pacing())
                .with_port_policy(config.port_policy()),
        );

        Self {
            store,
            hub,
            orchestrator,
            models,
            live_feeds: Arc::new(LiveFeedRegistry::new()),
            config: Arc::new(config),
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/games", get(games::list_games))
        .route("/api/games/:game_id", get(games::get_game))
        .route("/api/games/:game_id/wp-history", get(games::wp_history))
        .route("/api/replay/active", get(replay::active_runs))
        .route("/api/replay/:game_id/start", post(replay::start_replay))
        .route("/api/replay/:game_id/stop", post(replay::stop_replay))
        .route("/api/live/:game_id/start", post(live::start_live))
        .route("/api/live/:game_id/plays", post(live::push_play))
        .route("/api/live/:game_id/close", post(live::close_live))
        .route("/api/models/current", get(models::current_model))
        .route("/api/models/reload", post(models::reload_model))
        .route("/api/stream/games/:game_id", get(stream::sse_stream))
        .route("/ws/games/:game_id", get(stream::ws_stream))
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let db = state.store.ping();
    Json(json!({
        "status": if db { "ok" } else { "degraded" },
        "db": db,
        "active_runs": state.orchestrator.active_runs().len(),
    }))
}
