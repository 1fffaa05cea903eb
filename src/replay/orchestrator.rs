//! Drives event sources through prediction, persistence and broadcast.
//!
//! One spawned task per active run. A run owns a token; stopping or
//! restarting the game bumps the token, which wakes the task out of any
//! pacing sleep or source wait and makes it exit without touching the game
//! again. A play that already has a sequence number is always finished.

use super::pacing::{validate_speed, Pacer, PacingConfig};
use super::run_state::{ActiveRun, EntitySlot, RunRegistry, RunSnapshot};
use super::ReplayError;
use crate::features::FeatureVector;
use crate::history::{HistoryStore, NewRun};
use crate::models::{GameStatus, NewGame, Play, PredictionRecord, RawPlay, StreamEvent};
use crate::ports::{call_port, ModelHandle, ModelRegistry, PortPolicy, PortSet, TOP_ATTRIBUTIONS};
use crate::source::{EventSource, SourceMode};
use crate::stream::BroadcastHub;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StartedRun {
    pub run_token: u64,
    pub run_id: String,
    pub mode: SourceMode,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopReceipt {
    pub run_token: u64,
    pub run_id: String,
    /// Highest sequence handed out before the stop. A play with this
    /// sequence may still be in flight.
    pub last_sequence: u64,
}

#[derive(Debug)]
enum RunOutcome {
    Exhausted,
    Superseded,
    SourceFailed(String),
    StoreFailed(String),
}

struct RunContext {
    game_id: String,
    token: u64,
    run_id: String,
    model: Arc<ModelHandle>,
    slot: Arc<EntitySlot>,
    speed: f64,
    score: (i64, i64),
}

pub struct ReplayOrchestrator {
    store: Arc<HistoryStore>,
    hub: Arc<BroadcastHub>,
    ports: PortSet,
    models: Arc<ModelRegistry>,
    runs: RunRegistry,
    pacing: PacingConfig,
    port_policy: PortPolicy,
}

impl ReplayOrchestrator {
    pub fn new(
        store: Arc<HistoryStore>,
        hub: Arc<BroadcastHub>,
        ports: PortSet,
        models: Arc<ModelRegistry>,
    ) -> Self {
        Self {
            store,
            hub,
            ports,
            models,
            runs: RunRegistry::new(),
            pacing: PacingConfig::default(),
            port_policy: PortPolicy::default(),
        }
    }

    pub fn with_pacing(mut self, pacing: PacingConfig) -> Self {
        self.pacing = pacing;
        self
    }

    pub fn with_port_policy(mut self, policy: PortPolicy) -> Self {
        self.port_policy = policy;
        self
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn store(&self) -> &Arc<HistoryStore> {
        &self.store
    }

    /// Start a run for `game_id`. Rejects with `AlreadyRunning` while another
    /// run of the game is active. `speed` is ignored for live sources.
    pub fn start(
        self: &Arc<Self>,
        game_id: &str,
        source: Box<dyn EventSource>,
        speed: f64,
    ) -> Result<StartedRun, ReplayError> {
        let mode = source.mode();
        let speed = match mode {
            SourceMode::Paced => validate_speed(speed)?,
            SourceMode::Live => f64::INFINITY,
        };
        if self.runs.is_active(game_id) {
            return Err(ReplayError::AlreadyRunning {
                game_id: game_id.to_string(),
            });
        }

        let floor = self
            .store
            .max_sequence(game_id)
            .map_err(|e| ReplayError::StoreWriteFailure(e.to_string()))?;
        let model = self.models.current();
        let run_id = uuid::Uuid::new_v4().to_string();

        let (token, slot) = self.runs.try_activate(
            game_id,
            floor,
            ActiveRun {
                token: 0,
                run_id: run_id.clone(),
                speed: (mode == SourceMode::Paced).then_some(speed),
                mode,
                model_version: model.version_name().to_string(),
                started_at: Utc::now(),
            },
        )?;

        let metadata = source.metadata().clone();
        let recorded = self
            .store
            .upsert_game(&NewGame {
                id: game_id.to_string(),
                home_team: metadata.home_team.clone(),
                away_team: metadata.away_team.clone(),
                external_id: metadata.external_id.clone(),
            })
            .and_then(|_| {
                self.store.begin_run(&NewRun {
                    id: run_id.clone(),
                    game_id: game_id.to_string(),
                    token,
                    speed: (mode == SourceMode::Paced).then_some(speed),
                    mode: mode.as_str().to_string(),
                    model_version: model.version_name().to_string(),
                })
            })
            .and_then(|_| self.store.set_game_status(game_id, GameStatus::InProgress));
        if let Err(e) = recorded {
            self.runs.release(game_id, token, |_| {});
            error!(game_id, error = %e, "Failed to record run start");
            return Err(ReplayError::StoreWriteFailure(e.to_string()));
        }

        info!(
            game_id,
            run_id = %run_id,
            run_token = token,
            mode = mode.as_str(),
            speed,
            model = model.version_name(),
            total_plays = ?metadata.total_plays,
            "Run started"
        );

        let started = StartedRun {
            run_token: token,
            run_id: run_id.clone(),
            mode,
            model_version: model.version_name().to_string(),
        };

        let ctx = RunContext {
            game_id: game_id.to_string(),
            token,
            run_id,
            model,
            slot,
            speed,
            score: (0, 0),
        };
        let orchestrator = self.clone();
        tokio::spawn(async move {
            orchestrator.drive(ctx, source).await;
        });

        Ok(started)
    }

    /// Invalidate the active run. Takes effect at the run's next wake-up; a
    /// play already being processed is completed and published.
    pub fn stop(&self, game_id: &str) -> Result<StopReceipt, ReplayError> {
        let (run, last_sequence) = self.runs.deactivate(game_id, |run, _| {
            let (home, away) = self.last_score(game_id);
            self.finalize(game_id, &run.run_id, GameStatus::Interrupted, home, away);
        })?;

        info!(
            game_id,
            run_id = %run.run_id,
            run_token = run.token,
            last_sequence,
            "Run stopped"
        );
        Ok(StopReceipt {
            run_token: run.token,
            run_id: run.run_id,
            last_sequence,
        })
    }

    pub fn is_active(&self, game_id: &str) -> bool {
        self.runs.is_active(game_id)
    }

    pub fn active_run(&self, game_id: &str) -> Option<RunSnapshot> {
        self.runs.get(game_id)
    }

    pub fn active_runs(&self) -> Vec<RunSnapshot> {
        self.runs.active_runs()
    }

    async fn drive(self: Arc<Self>, mut ctx: RunContext, mut source: Box<dyn EventSource>) {
        let mut wake = ctx.slot.wake_receiver();
        let paced = source.mode() == SourceMode::Paced;
        let mut pacer = Pacer::new(ctx.speed, self.pacing.clone());

        {
            let _pipeline = ctx.slot.pipeline.lock().await;
            if self.runs.is_current(&ctx.game_id, ctx.token) {
                self.hub.clear_latest(&ctx.game_id);
                self.hub
                    .publish(StreamEvent::game_status(&ctx.game_id, GameStatus::InProgress, 0, 0));
            }
        }

        let outcome = loop {
            let next = tokio::select! {
                biased;
                _ = superseded(&mut wake, ctx.token) => break RunOutcome::Superseded,
                next = source.next_play() => next,
            };
            let raw = match next {
                Ok(Some(raw)) => raw,
                Ok(None) => break RunOutcome::Exhausted,
                Err(e) => break RunOutcome::SourceFailed(format!("{:#}", e)),
            };

            if paced {
                let delay = pacer.delay_for(raw.occurred_at_secs);
                if !delay.is_zero() {
                    tokio::select! {
                        biased;
                        _ = superseded(&mut wake, ctx.token) => break RunOutcome::Superseded,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }

            let slot = ctx.slot.clone();
            let _pipeline = slot.pipeline.lock().await;
            if let Err(outcome) = self.process_play(&mut ctx, raw).await {
                break outcome;
            }
        };

        self.finish(&ctx, outcome);
    }

    async fn process_play(&self, ctx: &mut RunContext, raw: RawPlay) -> Result<(), RunOutcome> {
        let game_id = ctx.game_id.as_str();
        let Some(sequence) = self.runs.next_sequence(game_id, ctx.token) else {
            return Err(RunOutcome::Superseded);
        };

        let play = Play::from_raw(sequence, &raw);
        let play_id = self
            .store
            .insert_play(game_id, &ctx.run_id, &play, &raw)
            .map_err(|e| RunOutcome::StoreFailed(format!("{:#}", e)))?;
        ctx.score = (raw.score_home, raw.score_away);

        let features = FeatureVector::from_play(&raw);
        let record = self.evaluate(game_id, &ctx.model, &features, &raw).await;

        self.store
            .insert_prediction(play_id, &record)
            .map_err(|e| RunOutcome::StoreFailed(format!("{:#}", e)))?;

        let report = self
            .hub
            .publish(StreamEvent::play_update(game_id, play, &record));
        debug!(
            game_id,
            sequence,
            home_wp = ?record.home_wp,
            degraded = record.degraded,
            delivered = report.delivered,
            "Play published"
        );
        Ok(())
    }

    /// Prediction then attribution, each under the port policy. Never fails:
    /// a port that stays down degrades the record instead.
    async fn evaluate(
        &self,
        game_id: &str,
        model: &ModelHandle,
        features: &FeatureVector,
        raw: &RawPlay,
    ) -> PredictionRecord {
        let prediction = call_port(&self.port_policy, "predict", game_id, || {
            self.ports.prediction.predict(model, features)
        })
        .await;

        let prediction = match prediction {
            Ok(p) => p,
            Err(e) => {
                warn!(game_id, error = %e, "Prediction unavailable, publishing degraded play");
                return PredictionRecord {
                    model_version: model.version_name().to_string(),
                    home_wp: None,
                    away_wp: None,
                    attributions: Vec::new(),
                    degraded: true,
                    degraded_reason: Some(e.to_string()),
                };
            }
        };

        let home_wp = if raw.is_decided() {
            if raw.score_differential() > 0 {
                1.0
            } else {
                0.0
            }
        } else {
            prediction.home_wp.clamp(0.0, 1.0)
        };

        let explained = call_port(&self.port_policy, "explain", game_id, || {
            self.ports.attribution.explain(model, features, TOP_ATTRIBUTIONS)
        })
        .await;

        let (attributions, degraded_reason) = match explained {
            Ok(attributions) => (attributions, None),
            Err(e) => {
                warn!(game_id, error = %e, "Attribution unavailable, publishing without explanation");
                (Vec::new(), Some(e.to_string()))
            }
        };

        PredictionRecord {
            model_version: prediction.model_version,
            home_wp: Some(home_wp),
            away_wp: Some(1.0 - home_wp),
            attributions,
            degraded: degraded_reason.is_some(),
            degraded_reason,
        }
    }

    fn finish(&self, ctx: &RunContext, outcome: RunOutcome) {
        let game_id = ctx.game_id.as_str();
        let (home, away) = ctx.score;
        match outcome {
            RunOutcome::Superseded => {
                debug!(game_id, run_token = ctx.token, "Run superseded, exiting");
            }
            RunOutcome::Exhausted => {
                let released = self.runs.release(game_id, ctx.token, |run| {
                    self.finalize(game_id, &run.run_id, GameStatus::Final, home, away);
                    self.hub.publish(StreamEvent::replay_complete(game_id));
                });
                if released {
                    info!(game_id, run_id = %ctx.run_id, home, away, "Run complete");
                }
            }
            RunOutcome::SourceFailed(reason) | RunOutcome::StoreFailed(reason) => {
                error!(game_id, run_id = %ctx.run_id, error = %reason, "Run failed");
                self.runs.release(game_id, ctx.token, |run| {
                    self.finalize(game_id, &run.run_id, GameStatus::Failed, home, away);
                });
            }
        }
    }

    /// Terminal bookkeeping for a run: game status, run outcome, and the
    /// status message subscribers see. Store errors are logged only; the
    /// status message goes out regardless.
    fn finalize(&self, game_id: &str, run_id: &str, status: GameStatus, home: i64, away: i64) {
        if let Err(e) = self.store.set_game_status(game_id, status) {
            error!(game_id, error = %e, "Failed to record game status {}", status);
        }
        if let Err(e) = self.store.finish_run(run_id, status.as_str()) {
            error!(game_id, run_id, error = %e, "Failed to record run outcome");
        }
        self.hub
            .publish(StreamEvent::game_status(game_id, status, home, away));
    }

    fn last_score(&self, game_id: &str) -> (i64, i64) {
        match self.store.get_game(game_id) {
            Ok(Some(game)) => (game.home_score, game.away_score),
            _ => (0, 0),
        }
    }
}

/// Resolves once `token` is no longer the game's current token.
async fn superseded(wake: &mut watch::Receiver<u64>, token: u64) {
    loop {
        if *wake.borrow_and_update() != token {
            return;
        }
        if wake.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{LinearWinModel, PortError};
    use crate::source::{ScriptedSource, SourceMetadata};
    use crate::testing::{fixture_plays, FnAttribution, FnPrediction};
    use std::time::Duration;

    fn metadata() -> SourceMetadata {
        SourceMetadata {
            home_team: "KC".to_string(),
            away_team: "CIN".to_string(),
            external_id: None,
            total_plays: None,
        }
    }

    fn fast_policy() -> PortPolicy {
        PortPolicy {
            timeout: Duration::from_millis(100),
            max_retries: 1,
            base_backoff: Duration::from_millis(1),
            jitter_factor: 0.0,
        }
    }

    fn orchestrator_with(ports: PortSet) -> Arc<ReplayOrchestrator> {
        let store = Arc::new(HistoryStore::in_memory().unwrap());
        let hub = Arc::new(BroadcastHub::new(64));
        let models = Arc::new(ModelRegistry::new(LinearWinModel::reference()));
        Arc::new(ReplayOrchestrator::new(store, hub, ports, models).with_port_policy(fast_policy()))
    }

    fn orchestrator() -> Arc<ReplayOrchestrator> {
        orchestrator_with(PortSet::linear())
    }

    fn plays(n: usize) -> Vec<RawPlay> {
        (0..n)
            .map(|i| RawPlay {
                occurred_at_secs: Some(i as f64 * 6.0),
                clock_seconds: 900 - i as u32 * 6,
                game_seconds_remaining: Some(3600 - i as u32 * 6),
                ..Default::default()
            })
            .collect()
    }

    async fn wait_until_idle(orch: &ReplayOrchestrator, game_id: &str) {
        for _ in 0..500 {
            if !orch.is_active(game_id) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("run for {} never finished", game_id);
    }

    #[tokio::test]
    async fn test_run_completes_and_publishes_in_order() {
        let orch = orchestrator();
        let mut sub = orch.hub().subscribe("g1");
        let source = ScriptedSource::new(metadata(), plays(4));
        let started = orch.start("g1", Box::new(source), f64::INFINITY).unwrap();
        assert_eq!(started.run_token, 1);

        let mut sequences = Vec::new();
        let mut last_status = None;
        while let Some(event) = sub.recv().await {
            match event.as_ref() {
                StreamEvent::PlayUpdate(u) => sequences.push(u.play.sequence),
                StreamEvent::GameStatus(s) => last_status = Some(s.status),
                StreamEvent::ReplayComplete { .. } => break,
            }
        }
        assert_eq!(sequences, vec![1, 2, 3, 4]);
        assert_eq!(last_status, Some(GameStatus::Final));

        wait_until_idle(&orch, "g1").await;
        let game = orch.store().get_game("g1").unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Final);
        assert_eq!(game.home_team, "KC");
        assert_eq!(orch.store().play_count("g1").unwrap(), 4);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_start_has_one_winner() {
        let orch = orchestrator();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let orch = orch.clone();
            handles.push(tokio::spawn(async move {
                let source = ScriptedSource::new(metadata(), plays(3));
                orch.start("g1", Box::new(source), 1.0)
            }));
        }

        let mut accepted = 0;
        let mut rejected = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => accepted += 1,
                Err(ReplayError::AlreadyRunning { .. }) => rejected += 1,
                Err(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(accepted, 1);
        assert_eq!(rejected, 7);
        orch.stop("g1").unwrap();
    }

    #[tokio::test]
    async fn test_stop_mid_pace_writes_nothing_more() {
        let orch = orchestrator();
        let source = ScriptedSource::new(metadata(), plays(10));
        // 6s gaps at speed 1: the second play is far in the future.
        orch.start("g1", Box::new(source), 1.0).unwrap();

        let mut sub = orch.hub().subscribe("g1");
        for _ in 0..200 {
            if orch.store().play_count("g1").unwrap() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let receipt = orch.stop("g1").unwrap();
        assert_eq!(receipt.last_sequence, 1);
        assert!(matches!(orch.stop("g1"), Err(ReplayError::NotRunning { .. })));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(orch.store().max_sequence("g1").unwrap(), 1);
        let game = orch.store().get_game("g1").unwrap().unwrap();
        assert_eq!(game.status, GameStatus::Interrupted);

        let mut saw_interrupted = false;
        while let Ok(event) = tokio::time::timeout(Duration::from_millis(20), sub.recv()).await {
            match event.as_deref() {
                Some(StreamEvent::GameStatus(s)) if s.status == GameStatus::Interrupted => {
                    saw_interrupted = true
                }
                Some(StreamEvent::PlayUpdate(u)) if u.play.sequence > receipt.last_sequence => {
                    panic!("play {} after stop", u.play.sequence)
                }
                Some(StreamEvent::ReplayComplete { .. }) => panic!("replay_complete after stop"),
                _ => {}
            }
            if event.is_none() {
                break;
            }
        }
        assert!(saw_interrupted);
    }

    #[tokio::test]
    async fn test_rerun_continues_sequence() {
        let orch = orchestrator();
        let source = ScriptedSource::new(metadata(), plays(3));
        orch.start("g1", Box::new(source), f64::INFINITY).unwrap();
        wait_until_idle(&orch, "g1").await;

        let source = ScriptedSource::new(metadata(), plays(2));
        let second = orch.start("g1", Box::new(source), f64::INFINITY).unwrap();
        assert_eq!(second.run_token, 2);
        wait_until_idle(&orch, "g1").await;

        assert_eq!(orch.store().max_sequence("g1").unwrap(), 5);
        let latest = orch
            .store()
            .history("g1", &crate::history::HistoryQuery::default())
            .unwrap();
        let seqs: Vec<_> = latest.iter().map(|r| r.play.sequence).collect();
        assert_eq!(seqs, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_port_failure_degrades_record_without_halting() {
        let ports = PortSet::new(
            Arc::new(FnPrediction::new(|features| {
                if features.get("game_seconds_remaining") == Some(3594.0) {
                    Err(PortError::Failure("model offline".to_string()))
                } else {
                    Ok(0.5)
                }
            })),
            Arc::new(FnAttribution::empty()),
        );
        let orch = orchestrator_with(ports);
        let mut sub = orch.hub().subscribe("g1");
        let source = ScriptedSource::new(metadata(), plays(3));
        orch.start("g1", Box::new(source), f64::INFINITY).unwrap();

        let mut updates = Vec::new();
        while let Some(event) = sub.recv().await {
            match event.as_ref() {
                StreamEvent::PlayUpdate(u) => updates.push(u.clone()),
                StreamEvent::ReplayComplete { .. } => break,
                _ => {}
            }
        }
        assert_eq!(updates.len(), 3);
        assert!(!updates[0].degraded);
        assert!(updates[1].degraded);
        assert!(updates[1].home_win_probability.is_none());
        assert!(updates[1].top_attributions.is_empty());
        assert_eq!(updates[2].home_win_probability, Some(0.5));
    }

    #[tokio::test]
    async fn test_store_failure_fails_run() {
        let orch = orchestrator();
        orch.store().break_writes();
        let mut sub = orch.hub().subscribe("g1");
        let source = ScriptedSource::new(metadata(), plays(3));
        orch.start("g1", Box::new(source), f64::INFINITY).unwrap();

        let mut statuses = Vec::new();
        while let Ok(Some(event)) = tokio::time::timeout(Duration::from_secs(2), sub.recv()).await {
            match event.as_ref() {
                StreamEvent::GameStatus(s) => {
                    statuses.push(s.status);
                    if s.status == GameStatus::Failed {
                        break;
                    }
                }
                StreamEvent::PlayUpdate(_) => panic!("play published despite store failure"),
                StreamEvent::ReplayComplete { .. } => panic!("failed run must not complete"),
            }
        }
        assert_eq!(statuses.last(), Some(&GameStatus::Failed));
        wait_until_idle(&orch, "g1").await;
        assert_eq!(
            orch.store().get_game("g1").unwrap().unwrap().status,
            GameStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_source_failure_fails_run() {
        let orch = orchestrator();
        let source = ScriptedSource::new(metadata(), plays(3)).failing_after(1);
        orch.start("g1", Box::new(source), f64::INFINITY).unwrap();
        wait_until_idle(&orch, "g1").await;

        assert_eq!(orch.store().play_count("g1").unwrap(), 1);
        assert_eq!(
            orch.store().get_game("g1").unwrap().unwrap().status,
            GameStatus::Failed
        );
    }

    #[tokio::test]
    async fn test_invalid_speed_rejected() {
        let orch = orchestrator();
        let source = ScriptedSource::new(metadata(), plays(1));
        assert!(matches!(
            orch.start("g1", Box::new(source), 0.0),
            Err(ReplayError::InvalidSpeed(_))
        ));
        let source = ScriptedSource::new(metadata(), plays(3));
        assert!(matches!(
            orch.start("g1", Box::new(source), 1e-300),
            Err(ReplayError::InvalidSpeed(_))
        ));
        assert!(!orch.is_active("g1"));
        assert!(orch.store().get_game("g1").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_end_of_game_is_clamped() {
        let orch = orchestrator_with(PortSet::new(
            Arc::new(FnPrediction::constant(0.83)),
            Arc::new(FnAttribution::empty()),
        ));
        let mut sub = orch.hub().subscribe("g1");
        let last = RawPlay {
            quarter: 4,
            clock_seconds: 0,
            score_home: 27,
            score_away: 24,
            ..Default::default()
        };
        let source = ScriptedSource::new(metadata(), fixture_plays().into_iter().chain([last]).collect());
        orch.start("g1", Box::new(source), f64::INFINITY).unwrap();

        let mut last_wp = None;
        while let Some(event) = sub.recv().await {
            match event.as_ref() {
                StreamEvent::PlayUpdate(u) => last_wp = u.home_win_probability,
                StreamEvent::ReplayComplete { .. } => break,
                _ => {}
            }
        }
        assert_eq!(last_wp, Some(1.0));
    }
}
