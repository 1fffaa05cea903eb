//! End-to-end replay of the three-play fixture through the public API.
//! Needs the `testing` feature: `cargo test --features testing`.

use clutchfactor_backend::history::{HistoryQuery, HistoryStore};
use clutchfactor_backend::models::{GameStatus, PlayUpdate, StreamEvent};
use clutchfactor_backend::ports::{LinearWinModel, ModelRegistry};
use clutchfactor_backend::replay::ReplayOrchestrator;
use clutchfactor_backend::stream::BroadcastHub;
use clutchfactor_backend::testing::{fixture_ports, fixture_source, FIXTURE_HOME_WP};
use std::sync::Arc;
use std::time::Duration;

const GAME: &str = "2022_20_CIN_KC";

fn orchestrator() -> Arc<ReplayOrchestrator> {
    Arc::new(ReplayOrchestrator::new(
        Arc::new(HistoryStore::in_memory().unwrap()),
        Arc::new(BroadcastHub::new(64)),
        fixture_ports(),
        Arc::new(ModelRegistry::new(LinearWinModel::reference())),
    ))
}

async fn wait_until_idle(orch: &ReplayOrchestrator) {
    for _ in 0..400 {
        if !orch.is_active(GAME) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("replay never finished");
}

#[tokio::test]
async fn fixture_replay_streams_three_updates_then_completes() {
    let orch = orchestrator();
    let mut sub = orch.hub().subscribe(GAME);
    assert!(sub.take_seed().is_none());

    orch.start(GAME, Box::new(fixture_source()), 50.0).unwrap();

    let mut kinds = Vec::new();
    let mut updates: Vec<PlayUpdate> = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await
            .expect("stream stalled")
            .expect("hub dropped subscriber");
        kinds.push(event.event_type());
        match event.as_ref() {
            StreamEvent::PlayUpdate(u) => updates.push(u.clone()),
            StreamEvent::ReplayComplete { .. } => break,
            StreamEvent::GameStatus(_) => {}
        }
    }

    let messages: Vec<_> = kinds
        .iter()
        .copied()
        .filter(|k| *k != "game_status")
        .collect();
    assert_eq!(
        messages,
        vec!["play_update", "play_update", "play_update", "replay_complete"]
    );

    let sequences: Vec<u64> = updates.iter().map(|u| u.play.sequence).collect();
    assert_eq!(sequences, vec![1, 2, 3]);

    let wp: Vec<f64> = updates
        .iter()
        .map(|u| u.home_win_probability.unwrap())
        .collect();
    for (got, want) in wp.iter().zip(FIXTURE_HOME_WP) {
        assert!((got - want).abs() < 1e-9, "wp {} != {}", got, want);
    }
    assert!(((wp[1] - wp[0]) - (-0.04)).abs() < 1e-9);
    assert!(((wp[2] - wp[1]) - 0.22).abs() < 1e-9);

    for update in &updates {
        let away = update.away_win_probability.unwrap();
        assert!((update.home_win_probability.unwrap() + away - 1.0).abs() < 1e-9);
        assert!(!update.top_attributions.is_empty());
        assert!(update.top_attributions.len() <= 5);
        assert!(!update.degraded);
    }
    assert_eq!(updates[2].play.score_home, 6);

    wait_until_idle(&orch).await;
    let game = orch.store().get_game(GAME).unwrap().unwrap();
    assert_eq!(game.status, GameStatus::Final);
    assert_eq!((game.home_score, game.away_score), (6, 0));
}

#[tokio::test]
async fn history_matches_what_was_streamed() {
    let orch = orchestrator();
    let mut sub = orch.hub().subscribe(GAME);
    orch.start(GAME, Box::new(fixture_source()), 50.0).unwrap();

    let mut streamed = Vec::new();
    while let Some(event) = sub.recv().await {
        match event.as_ref() {
            StreamEvent::PlayUpdate(u) => streamed.push(u.clone()),
            StreamEvent::ReplayComplete { .. } => break,
            StreamEvent::GameStatus(_) => {}
        }
    }
    wait_until_idle(&orch).await;

    let history = orch.store().history(GAME, &HistoryQuery::default()).unwrap();
    assert_eq!(history.len(), streamed.len());
    for (row, update) in history.iter().zip(&streamed) {
        assert_eq!(row.play, update.play);
        assert_eq!(row.home_win_probability, update.home_win_probability);
        assert_eq!(row.top_attributions, update.top_attributions);
        assert_eq!(row.model_version.as_deref(), Some(update.model_version.as_str()));
    }

    let after_first = orch
        .store()
        .history(
            GAME,
            &HistoryQuery {
                after_sequence: Some(1),
                ..HistoryQuery::default()
            },
        )
        .unwrap();
    let sequences: Vec<u64> = after_first.iter().map(|r| r.play.sequence).collect();
    assert_eq!(sequences, vec![2, 3]);
}

#[tokio::test]
async fn late_joiner_is_seeded_without_duplicates() {
    let orch = orchestrator();
    let mut early = orch.hub().subscribe(GAME);
    // 6s gaps at speed 5: 1.2s between plays leaves room to join mid-run.
    orch.start(GAME, Box::new(fixture_source()), 5.0).unwrap();

    loop {
        let event = early.recv().await.unwrap();
        if matches!(event.as_ref(), StreamEvent::PlayUpdate(_)) {
            break;
        }
    }

    let mut late = orch.hub().subscribe(GAME);
    let seed = late.take_seed().expect("late joiner gets the latest update");
    let seeded_sequence = match seed.as_ref() {
        StreamEvent::PlayUpdate(u) => u.play.sequence,
        other => panic!("seed should be a play update, got {:?}", other),
    };

    let mut sequences = vec![seeded_sequence];
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), late.recv())
            .await
            .expect("stream stalled")
            .unwrap();
        match event.as_ref() {
            StreamEvent::PlayUpdate(u) => sequences.push(u.play.sequence),
            StreamEvent::ReplayComplete { .. } => break,
            StreamEvent::GameStatus(_) => {}
        }
    }

    assert!(sequences.windows(2).all(|w| w[0] < w[1]), "{:?}", sequences);
    assert_eq!(sequences.last(), Some(&3));
}
