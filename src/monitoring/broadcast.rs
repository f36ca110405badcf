// Live broadcast to dashboard observers

use super::metrics::MetricsSnapshot;
use super::notifications::Notification;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Default per-observer backlog before old events are dropped
pub const DEFAULT_CAPACITY: usize = 1000;

/// Event pushed to every connected observer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LiveEvent {
    Metrics(MetricsSnapshot),
    Alert(Notification),
}

/// Publisher side of the live broadcast
pub trait LiveBroadcast: Send + Sync {
    /// Send to the observers connected right now; returns how many there were
    fn publish(&self, event: LiveEvent) -> usize;

    fn observer_count(&self) -> usize;
}

/// Fan-out hub. Observers may join or leave at any time without
/// coordinating with publishers.
#[derive(Debug, Clone)]
pub struct BroadcastHub {
    sender: broadcast::Sender<LiveEvent>,
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Register an observer; dropping the returned handle unregisters it
    pub fn subscribe(&self) -> Observer {
        Observer {
            receiver: self.sender.subscribe(),
        }
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl LiveBroadcast for BroadcastHub {
    fn publish(&self, event: LiveEvent) -> usize {
        // No receivers is not an error for a live feed
        match self.sender.send(event) {
            Ok(observers) => observers,
            Err(_) => 0,
        }
    }

    fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// One connected observer
#[derive(Debug)]
pub struct Observer {
    receiver: broadcast::Receiver<LiveEvent>,
}

impl Observer {
    /// Next event, skipping over any backlog this observer fell behind on.
    /// Returns `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<LiveEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Live observer lagged, dropping old events");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    debug!("Live broadcast closed");
                    return None;
                }
            }
        }
    }

    /// Non-blocking poll
    pub fn try_next(&mut self) -> Option<LiveEvent> {
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    }
}
