//! Per-game run bookkeeping.
//!
//! Every game has a slot holding its run token, the active run (if any) and
//! the sequence cursor. All transitions for a game go through the slot's
//! mutex; different games never share a lock.

use super::ReplayError;
use crate::source::SourceMode;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActiveRun {
    pub token: u64,
    pub run_id: String,
    pub speed: Option<f64>,
    pub mode: SourceMode,
    pub model_version: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunSnapshot {
    pub game_id: String,
    #[serde(flatten)]
    pub run: ActiveRun,
    pub cursor: u64,
}

#[derive(Debug, Default)]
struct RunState {
    current_token: u64,
    active: Option<ActiveRun>,
    /// Last sequence number handed out. Never decreases.
    cursor: u64,
}

pub(crate) struct EntitySlot {
    state: Mutex<RunState>,
    /// Carries the current token; a change wakes the run it supersedes.
    wake: watch::Sender<u64>,
    /// Held from sequence assignment through publish so plays of one game
    /// reach the hub in sequence order, even across a stop and restart.
    pub(crate) pipeline: tokio::sync::Mutex<()>,
}

impl EntitySlot {
    fn new() -> Self {
        let (wake, _) = watch::channel(0);
        Self {
            state: Mutex::new(RunState::default()),
            wake,
            pipeline: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn wake_receiver(&self) -> watch::Receiver<u64> {
        self.wake.subscribe()
    }
}

#[derive(Default)]
pub struct RunRegistry {
    slots: RwLock<HashMap<String, Arc<EntitySlot>>>,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn slot(&self, game_id: &str) -> Arc<EntitySlot> {
        if let Some(slot) = self.slots.read().get(game_id) {
            return slot.clone();
        }
        self.slots
            .write()
            .entry(game_id.to_string())
            .or_insert_with(|| Arc::new(EntitySlot::new()))
            .clone()
    }

    /// Check-and-set: make `run` the active run unless one already is.
    /// Allocates a fresh token and lifts the cursor to at least `floor`.
    pub(crate) fn try_activate(
        &self,
        game_id: &str,
        floor: u64,
        mut run: ActiveRun,
    ) -> Result<(u64, Arc<EntitySlot>), ReplayError> {
        let slot = self.slot(game_id);
        let token = {
            let mut state = slot.state.lock();
            if state.active.is_some() {
                return Err(ReplayError::AlreadyRunning {
                    game_id: game_id.to_string(),
                });
            }
            state.current_token += 1;
            state.cursor = state.cursor.max(floor);
            run.token = state.current_token;
            state.active = Some(run);
            state.current_token
        };
        slot.wake.send_replace(token);
        Ok((token, slot))
    }

    /// Invalidate the active run's token. `finalize` runs before the slot is
    /// unlocked, so no new run can start until it returns.
    pub(crate) fn deactivate<F>(&self, game_id: &str, finalize: F) -> Result<(ActiveRun, u64), ReplayError>
    where
        F: FnOnce(&ActiveRun, u64),
    {
        let not_running = || ReplayError::NotRunning {
            game_id: game_id.to_string(),
        };
        let slot = self.slots.read().get(game_id).cloned().ok_or_else(not_running)?;

        let (run, cursor, token) = {
            let mut state = slot.state.lock();
            let run = state.active.take().ok_or_else(not_running)?;
            state.current_token += 1;
            finalize(&run, state.cursor);
            (run, state.cursor, state.current_token)
        };
        slot.wake.send_replace(token);
        Ok((run, cursor))
    }

    /// End the run holding `token` on its own terms. Returns false, without
    /// calling `finalize`, when that run was already stopped.
    pub(crate) fn release<F>(&self, game_id: &str, token: u64, finalize: F) -> bool
    where
        F: FnOnce(&ActiveRun),
    {
        let Some(slot) = self.slots.read().get(game_id).cloned() else {
            return false;
        };
        let mut state = slot.state.lock();
        match state.active.take() {
            Some(run) if run.token == token => {
                finalize(&run);
                true
            }
            other => {
                state.active = other;
                false
            }
        }
    }

    /// Next sequence number for the run holding `token`, or `None` if that
    /// run is no longer active.
    pub(crate) fn next_sequence(&self, game_id: &str, token: u64) -> Option<u64> {
        let slot = self.slots.read().get(game_id).cloned()?;
        let mut state = slot.state.lock();
        if state.active.as_ref().map(|run| run.token) != Some(token) {
            return None;
        }
        state.cursor += 1;
        Some(state.cursor)
    }

    pub fn is_current(&self, game_id: &str, token: u64) -> bool {
        self.slots
            .read()
            .get(game_id)
            .map(|slot| matches!(&slot.state.lock().active, Some(run) if run.token == token))
            .unwrap_or(false)
    }

    pub fn is_active(&self, game_id: &str) -> bool {
        self.get(game_id).is_some()
    }

    pub fn get(&self, game_id: &str) -> Option<RunSnapshot> {
        let slot = self.slots.read().get(game_id).cloned()?;
        let state = slot.state.lock();
        state.active.as_ref().map(|run| RunSnapshot {
            game_id: game_id.to_string(),
            run: run.clone(),
            cursor: state.cursor,
        })
    }

    pub fn active_runs(&self) -> Vec<RunSnapshot> {
        let slots: Vec<(String, Arc<EntitySlot>)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut runs: Vec<RunSnapshot> = slots
            .into_iter()
            .filter_map(|(game_id, slot)| {
                let state = slot.state.lock();
                state.active.as_ref().map(|run| RunSnapshot {
                    game_id,
                    run: run.clone(),
                    cursor: state.cursor,
                })
            })
            .collect();
        runs.sort_by(|a, b| a.game_id.cmp(&b.game_id));
        runs
    }
}
