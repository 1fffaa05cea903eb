//! Local replay runner
//!
//! Runs one game from a play-by-play CSV through prediction, storage and
//! broadcast without the HTTP server, printing every streamed message as a
//! JSON line on stdout. Logs go to stderr.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin replay_local -- \
//!   --csv data/play_by_play_2022.csv \
//!   --game 2022_20_CIN_KC \
//!   --speed 20 \
//!   --db /tmp/replay.db
//! ```
//!
//! # Exit Codes
//!
//! - 0: Replay completed
//! - 2: Configuration or input error
//! - 3: Run failed or was interrupted

use anyhow::{Context, Result};
use clap::Parser;
use clutchfactor_backend::{
    history::HistoryStore,
    models::{GameStatus, StreamEvent},
    ports::{ModelRegistry, PortSet},
    replay::ReplayOrchestrator,
    source::CsvReplaySource,
    stream::{encode, BroadcastHub},
};
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "replay_local")]
#[command(about = "Replay one game through the win-probability pipeline and print the stream")]
struct Args {
    /// nflfastR play-by-play CSV
    #[arg(long)]
    csv: PathBuf,

    /// Game id inside the CSV, e.g. 2022_20_CIN_KC
    #[arg(long)]
    game: String,

    /// Replay speed multiplier; unpaced when omitted
    #[arg(long)]
    speed: Option<f64>,

    /// SQLite history database; in-memory when omitted
    #[arg(long)]
    db: Option<String>,

    /// TOML model definition; the built-in reference model when omitted
    #[arg(long)]
    model: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "clutchfactor_backend=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let orchestrator = match build(&args) {
        Ok(o) => o,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    match run(&args, orchestrator).await {
        Ok(GameStatus::Final) => ExitCode::SUCCESS,
        Ok(status) => {
            error!(game = %args.game, status = %status, "Replay did not complete");
            ExitCode::from(3)
        }
        Err(e) => {
            error!("{:#}", e);
            ExitCode::from(2)
        }
    }
}

fn build(args: &Args) -> Result<Arc<ReplayOrchestrator>> {
    let store = match &args.db {
        Some(path) => HistoryStore::new(path)?,
        None => HistoryStore::in_memory()?,
    };
    let models = ModelRegistry::from_path(args.model.clone())?;
    Ok(Arc::new(ReplayOrchestrator::new(
        Arc::new(store),
        Arc::new(BroadcastHub::default()),
        PortSet::linear(),
        Arc::new(models),
    )))
}

/// Returns the status the game ended in.
async fn run(args: &Args, orchestrator: Arc<ReplayOrchestrator>) -> Result<GameStatus> {
    let source = CsvReplaySource::open(&args.csv, &args.game)
        .with_context(|| format!("Failed to load {}", args.csv.display()))?;

    let mut subscription = orchestrator.hub().subscribe(&args.game);
    let started = orchestrator.start(
        &args.game,
        Box::new(source),
        args.speed.unwrap_or(f64::INFINITY),
    )?;
    info!(run_id = %started.run_id, model = %started.model_version, "Replay started");

    let stdout = std::io::stdout();
    let mut last_status = GameStatus::InProgress;
    while let Some(event) = subscription.recv().await {
        {
            let mut out = stdout.lock();
            writeln!(out, "{}", encode(&event))?;
        }
        match event.as_ref() {
            StreamEvent::GameStatus(update) => {
                last_status = update.status;
                if matches!(update.status, GameStatus::Failed | GameStatus::Interrupted) {
                    break;
                }
            }
            StreamEvent::ReplayComplete { .. } => break,
            StreamEvent::PlayUpdate(_) => {}
        }
    }

    Ok(last_status)
}
