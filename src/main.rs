//! ClutchFactor - play-by-play win probability server
//! Replays historical games or follows a live feed, scores every play and
//! streams the updates over SSE and WebSocket.

use anyhow::{Context, Result};
use clap::Parser;
use clutchfactor_backend::{
    build_router,
    config::{AppConfig, ServerArgs},
    history::HistoryStore,
    ports::{ModelRegistry, PortSet},
    AppState,
};
use dotenv::dotenv;
use std::net::SocketAddr;
use std::path::Path;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let config = AppConfig::from(ServerArgs::parse());
    info!("🏈 ClutchFactor starting");
    info!(
        db = %config.db_path,
        data_dir = %config.data_dir.display(),
        queue_capacity = config.subscriber_queue_capacity,
        "Configuration loaded"
    );

    let store = HistoryStore::new(&config.db_path)
        .with_context(|| format!("Failed to open history store at {}", config.db_path))?;
    let models = ModelRegistry::from_path(config.model_path.clone())
        .context("Failed to load win-probability model")?;

    let bind_addr = config.bind_addr;
    let state = AppState::new(config, store, models, PortSet::linear());
    let app = build_router(state);

    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", bind_addr))?;
    info!("🎯 API server listening on {}", bind_addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("Server error")?;

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clutchfactor_backend=debug,clutchfactor=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // 1) Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // 2) Also the crate's own .env when launched from elsewhere
    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let candidates = [manifest_dir.join(".env"), manifest_dir.join("../.env")];
    for p in candidates {
        if p.exists() {
            let _ = dotenv::from_path(&p);
        }
    }
}
