//! Per-game fan-out with a cached latest message.
//!
//! Each subscriber owns a bounded queue. Publishing never waits: a full queue
//! means the subscriber is too slow, so it is removed and its channel closes.
//! The client then reconnects and re-seeds from history.

use crate::models::StreamEvent;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Queue full: the subscriber did not keep up.
    Overrun,
    /// Receiver already gone.
    Closed,
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DropReason::Overrun => f.write_str("subscriber overrun"),
            DropReason::Closed => f.write_str("subscriber closed"),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: Vec<(u64, DropReason)>,
}

struct SubscriberSlot {
    tx: mpsc::Sender<Arc<StreamEvent>>,
    last_sequence: Option<u64>,
}

#[derive(Default)]
struct Topic {
    latest: Option<Arc<StreamEvent>>,
    subscribers: HashMap<u64, SubscriberSlot>,
    /// Set once the topic is removed from the map; holders of a stale `Arc`
    /// must look it up again.
    retired: bool,
}

impl Topic {
    fn is_idle(&self) -> bool {
        self.subscribers.is_empty() && self.latest.is_none()
    }
}

pub struct BroadcastHub {
    topics: RwLock<HashMap<String, Arc<Mutex<Topic>>>>,
    next_id: AtomicU64,
    capacity: usize,
}

/// A live subscription. Dropping it unsubscribes.
pub struct Subscription {
    pub id: u64,
    pub game_id: String,
    /// Latest message at subscribe time, if any.
    pub seed: Option<Arc<StreamEvent>>,
    rx: mpsc::Receiver<Arc<StreamEvent>>,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    /// Next published message; `None` once the hub dropped this subscriber.
    pub async fn recv(&mut self) -> Option<Arc<StreamEvent>> {
        self.rx.recv().await
    }

    pub fn take_seed(&mut self) -> Option<Arc<StreamEvent>> {
        self.seed.take()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(&self.game_id, self.id);
        }
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            capacity: capacity.max(1),
        }
    }

    fn topic(&self, game_id: &str) -> Arc<Mutex<Topic>> {
        if let Some(topic) = self.topics.read().get(game_id) {
            return topic.clone();
        }
        self.topics
            .write()
            .entry(game_id.to_string())
            .or_default()
            .clone()
    }

    /// Run `f` on the live topic for `game_id`, creating it if needed.
    fn with_topic<R>(&self, game_id: &str, f: impl FnOnce(&mut Topic) -> R) -> R {
        loop {
            let topic = self.topic(game_id);
            let mut guard = topic.lock();
            if guard.retired {
                continue;
            }
            return f(&mut *guard);
        }
    }

    /// Drop the topic if nobody listens and nothing is cached. Lock order is
    /// map then topic, as everywhere else.
    fn prune(&self, game_id: &str) {
        let mut topics = self.topics.write();
        let idle = match topics.get(game_id) {
            Some(topic) => {
                let mut topic = topic.lock();
                if topic.is_idle() {
                    topic.retired = true;
                }
                topic.retired
            }
            None => false,
        };
        if idle {
            topics.remove(game_id);
            debug!(game_id, "Removed idle topic");
        }
    }

    /// Register a subscriber. The seed and the registration happen under the
    /// topic lock, so a concurrent publish lands in exactly one of them.
    pub fn subscribe(self: &Arc<Self>, game_id: &str) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let seed = self.with_topic(game_id, |topic| {
            let seed = topic.latest.clone();
            topic.subscribers.insert(
                id,
                SubscriberSlot {
                    tx,
                    last_sequence: seed.as_ref().and_then(|e| e.sequence()),
                },
            );
            seed
        });

        debug!(game_id, subscriber_id = id, seeded = seed.is_some(), "Subscribed");
        Subscription {
            id,
            game_id: game_id.to_string(),
            seed,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Cache (unless terminal) and deliver without waiting on any subscriber.
    pub fn publish(&self, event: StreamEvent) -> PublishReport {
        let event = Arc::new(event);
        let (report, idle) = self.with_topic(event.game_id(), |topic| {
            if event.is_cacheable() {
                topic.latest = Some(event.clone());
            }

            let mut report = PublishReport::default();
            for (id, slot) in topic.subscribers.iter_mut() {
                match slot.tx.try_send(event.clone()) {
                    Ok(()) => {
                        if let Some(seq) = event.sequence() {
                            slot.last_sequence = Some(seq);
                        }
                        report.delivered += 1;
                    }
                    Err(TrySendError::Full(_)) => report.dropped.push((*id, DropReason::Overrun)),
                    Err(TrySendError::Closed(_)) => report.dropped.push((*id, DropReason::Closed)),
                }
            }

            for (id, reason) in &report.dropped {
                if let Some(slot) = topic.subscribers.remove(id) {
                    if *reason == DropReason::Overrun {
                        warn!(
                            game_id = %event.game_id(),
                            subscriber_id = id,
                            last_sequence = ?slot.last_sequence,
                            "Dropping subscriber: {}",
                            reason
                        );
                    }
                }
            }
            (report, topic.is_idle())
        });

        if idle {
            self.prune(event.game_id());
        }
        report
    }

    /// Idempotent. Returns whether the subscriber was still registered.
    pub fn unsubscribe(&self, game_id: &str, subscriber_id: u64) -> bool {
        let Some(topic) = self.topics.read().get(game_id).cloned() else {
            return false;
        };
        let (removed, idle) = {
            let mut topic = topic.lock();
            let removed = topic.subscribers.remove(&subscriber_id).is_some();
            (removed, topic.is_idle())
        };
        if removed {
            debug!(game_id, subscriber_id, "Unsubscribed");
        }
        if idle {
            self.prune(game_id);
        }
        removed
    }

    pub fn latest(&self, game_id: &str) -> Option<Arc<StreamEvent>> {
        let topic = self.topics.read().get(game_id).cloned()?;
        let latest = topic.lock().latest.clone();
        latest
    }

    /// Forget the cached message so the next run's subscribers are not
    /// seeded with the previous run's last play.
    pub fn clear_latest(&self, game_id: &str) {
        let Some(topic) = self.topics.read().get(game_id).cloned() else {
            return;
        };
        let idle = {
            let mut topic = topic.lock();
            topic.latest = None;
            topic.is_idle()
        };
        if idle {
            self.prune(game_id);
        }
    }

    pub fn subscriber_count(&self, game_id: &str) -> usize {
        self.topics
            .read()
            .get(game_id)
            .map(|t| t.lock().subscribers.len())
            .unwrap_or(0)
    }

    /// Games with subscribers or a cached message.
    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_SUBSCRIBER_CAPACITY)
    }
}
