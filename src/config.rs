//! Server configuration: CLI flags with environment fallbacks.

use crate::ports::PortPolicy;
use crate::replay::{PacingConfig, MIN_SPEED};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[command(name = "clutchfactor")]
#[command(about = "Win-probability replay and streaming server")]
pub struct ServerArgs {
    /// Address to bind the HTTP server to
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: SocketAddr,

    /// SQLite history database (relative paths resolve against the crate dir)
    #[arg(long, env = "DB_PATH")]
    pub db_path: Option<String>,

    /// Directory holding replay CSV files
    #[arg(long, env = "REPLAY_DATA_DIR")]
    pub data_dir: Option<String>,

    /// Per-subscriber queue length before a slow client is dropped
    #[arg(long, env = "SUBSCRIBER_QUEUE_CAPACITY", default_value = "200")]
    pub subscriber_queue_capacity: usize,

    /// Idle interval between stream heartbeats, in seconds
    #[arg(long, env = "STREAM_HEARTBEAT_SECS", default_value = "15")]
    pub heartbeat_secs: u64,

    #[arg(long, env = "PORT_TIMEOUT_MS", default_value = "2000")]
    pub port_timeout_ms: u64,

    #[arg(long, env = "PORT_MAX_RETRIES", default_value = "2")]
    pub port_max_retries: u32,

    #[arg(long, env = "PORT_BACKOFF_MS", default_value = "50")]
    pub port_backoff_ms: u64,

    /// Gap assumed between plays without timestamps, in milliseconds
    #[arg(long, env = "DEFAULT_PLAY_GAP_MS", default_value = "1000")]
    pub default_play_gap_ms: u64,

    /// Longest real-time gap between two plays, in milliseconds
    #[arg(long, env = "MAX_PLAY_GAP_MS", default_value = "30000")]
    pub max_play_gap_ms: u64,

    /// Lowest speed multiplier accepted by the start endpoint
    #[arg(long, env = "MIN_SPEED", default_value = "0.1")]
    pub min_speed: f64,

    /// Highest speed multiplier accepted by the start endpoint
    #[arg(long, env = "MAX_SPEED", default_value = "10000")]
    pub max_speed: f64,

    /// TOML model definition; the built-in reference model is used when unset
    #[arg(long, env = "MODEL_PATH")]
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub db_path: String,
    pub data_dir: PathBuf,
    pub subscriber_queue_capacity: usize,
    pub heartbeat: Duration,
    pub port_timeout: Duration,
    pub port_max_retries: u32,
    pub port_backoff: Duration,
    pub default_play_gap: Duration,
    pub max_play_gap: Duration,
    pub min_speed: f64,
    pub max_speed: f64,
    pub model_path: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8000)),
            db_path: resolve_data_path(None, "clutchfactor.db"),
            data_dir: PathBuf::from(resolve_data_path(None, "data")),
            subscriber_queue_capacity: 200,
            heartbeat: Duration::from_secs(15),
            port_timeout: Duration::from_millis(2000),
            port_max_retries: 2,
            port_backoff: Duration::from_millis(50),
            default_play_gap: Duration::from_millis(1000),
            max_play_gap: Duration::from_millis(30_000),
            min_speed: 0.1,
            max_speed: 10_000.0,
            model_path: None,
        }
    }
}

impl From<ServerArgs> for AppConfig {
    fn from(args: ServerArgs) -> Self {
        Self {
            bind_addr: args.bind_addr,
            db_path: resolve_data_path(args.db_path, "clutchfactor.db"),
            data_dir: PathBuf::from(resolve_data_path(args.data_dir, "data")),
            subscriber_queue_capacity: args.subscriber_queue_capacity.max(1),
            heartbeat: Duration::from_secs(args.heartbeat_secs.max(1)),
            port_timeout: Duration::from_millis(args.port_timeout_ms),
            port_max_retries: args.port_max_retries,
            port_backoff: Duration::from_millis(args.port_backoff_ms),
            default_play_gap: Duration::from_millis(args.default_play_gap_ms),
            max_play_gap: Duration::from_millis(args.max_play_gap_ms),
            min_speed: args.min_speed.max(MIN_SPEED),
            max_speed: args.max_speed,
            model_path: args.model_path,
        }
    }
}

impl AppConfig {
    pub fn pacing(&self) -> PacingConfig {
        PacingConfig {
            default_gap: self.default_play_gap,
            max_gap: self.max_play_gap,
        }
    }

    pub fn port_policy(&self) -> PortPolicy {
        PortPolicy {
            timeout: self.port_timeout,
            max_retries: self.port_max_retries,
            base_backoff: self.port_backoff,
            ..PortPolicy::default()
        }
    }
}

/// Resolve a configured path. Relative paths are taken relative to the crate
/// directory, not the caller's cwd; unset values fall back to `default_name`
/// there.
pub fn resolve_data_path(env_value: Option<String>, default_name: &str) -> String {
    let base = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
    let Some(raw) = env_value.filter(|v| !v.trim().is_empty()) else {
        return base.join(default_name).to_string_lossy().to_string();
    };

    let p = PathBuf::from(raw);
    if p.is_absolute() || p.to_str() == Some(":memory:") {
        return p.to_string_lossy().to_string();
    }
    base.join(p).to_string_lossy().to_string()
}
