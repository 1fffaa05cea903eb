//! Turns a hub subscription into the frame sequence a stream client sees:
//! the seed first, then live messages, with heartbeats while idle. The
//! session ends after a terminal message or when the hub drops the
//! subscriber. A seed saying the game is already over does not end it: the
//! client keeps heartbeats and sees a re-run of the same game.

use super::hub::{BroadcastHub, Subscription};
use crate::models::StreamEvent;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Event(Arc<StreamEvent>),
    Heartbeat,
}

pub struct GatewaySession {
    subscription: Subscription,
    heartbeat: Duration,
    finished: bool,
}

impl GatewaySession {
    pub fn open(hub: &Arc<BroadcastHub>, game_id: &str, heartbeat: Duration) -> Self {
        Self {
            subscription: hub.subscribe(game_id),
            heartbeat,
            finished: false,
        }
    }

    pub fn game_id(&self) -> &str {
        &self.subscription.game_id
    }

    pub fn subscriber_id(&self) -> u64 {
        self.subscription.id
    }

    /// `None` once the stream should close.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        if self.finished {
            return None;
        }
        if let Some(seed) = self.subscription.take_seed() {
            return Some(self.forward(seed));
        }

        match tokio::time::timeout(self.heartbeat, self.subscription.recv()).await {
            Ok(Some(event)) => Some(self.forward(event)),
            Ok(None) => {
                debug!(
                    game_id = %self.subscription.game_id,
                    subscriber_id = self.subscription.id,
                    "Subscription closed by hub"
                );
                self.finished = true;
                None
            }
            Err(_) => Some(Frame::Heartbeat),
        }
    }

    fn forward(&mut self, event: Arc<StreamEvent>) -> Frame {
        if event.is_terminal() {
            self.finished = true;
        }
        Frame::Event(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::GameStatus;

    #[tokio::test]
    async fn test_seed_then_live_then_close_on_complete() {
        let hub = Arc::new(BroadcastHub::new(8));
        hub.publish(StreamEvent::game_status("g1", GameStatus::InProgress, 0, 0));

        let mut session = GatewaySession::open(&hub, "g1", Duration::from_secs(5));
        match session.next_frame().await {
            Some(Frame::Event(e)) => assert_eq!(e.event_type(), "game_status"),
            other => panic!("expected seed, got {:?}", other),
        }

        hub.publish(StreamEvent::replay_complete("g1"));
        match session.next_frame().await {
            Some(Frame::Event(e)) => assert!(e.is_terminal()),
            other => panic!("expected replay_complete, got {:?}", other),
        }
        assert!(session.next_frame().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_session_emits_heartbeat() {
        let hub = Arc::new(BroadcastHub::new(8));
        let mut session = GatewaySession::open(&hub, "g1", Duration::from_secs(15));
        assert_eq!(session.next_frame().await, Some(Frame::Heartbeat));
        assert_eq!(hub.subscriber_count("g1"), 1);
    }

    #[tokio::test]
    async fn test_dropping_session_unsubscribes() {
        let hub = Arc::new(BroadcastHub::new(8));
        let session = GatewaySession::open(&hub, "g1", Duration::from_secs(15));
        assert_eq!(hub.subscriber_count("g1"), 1);
        drop(session);
        assert_eq!(hub.subscriber_count("g1"), 0);
        assert_eq!(hub.topic_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_finished_game_seed_stays_open_for_rerun() {
        let hub = Arc::new(BroadcastHub::new(8));
        hub.publish(StreamEvent::game_status("g1", GameStatus::Final, 6, 0));

        let mut session = GatewaySession::open(&hub, "g1", Duration::from_secs(15));
        match session.next_frame().await {
            Some(Frame::Event(e)) => assert_eq!(
                e.as_ref(),
                &StreamEvent::game_status("g1", GameStatus::Final, 6, 0)
            ),
            other => panic!("expected final status seed, got {:?}", other),
        }
        assert_eq!(session.next_frame().await, Some(Frame::Heartbeat));

        hub.publish(StreamEvent::game_status("g1", GameStatus::InProgress, 0, 0));
        match session.next_frame().await {
            Some(Frame::Event(e)) => assert_eq!(e.event_type(), "game_status"),
            other => panic!("expected re-run status, got {:?}", other),
        }
        hub.publish(StreamEvent::replay_complete("g1"));
        assert!(matches!(session.next_frame().await, Some(Frame::Event(e)) if e.is_terminal()));
        assert!(session.next_frame().await.is_none());
    }
}
