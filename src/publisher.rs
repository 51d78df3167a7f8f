//! Process-wide notification bus.
//!
//! [`Publisher`] is a thin wrapper around [`tokio::sync::broadcast`]. Every
//! supervisor holds a clone and pushes [`Notification`]s onto it; observers
//! subscribe and react without polling.
//!
//! Publishing never blocks. Notifications sent while nobody is subscribed are
//! dropped, and slow receivers observe `RecvError::Lagged` and skip ahead, so
//! consumers must tolerate missed or duplicate notifications.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

/// A change observers may want to react to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "topic", content = "payload")]
pub enum Notification {
    /// The log sequence of `subdomain` was appended to or cleared.
    #[serde(rename = "runtime.log.updated")]
    LogUpdated { subdomain: String },
}

impl Notification {
    pub fn topic(&self) -> &'static str {
        match self {
            Notification::LogUpdated { .. } => "runtime.log.updated",
        }
    }

    pub fn subdomain(&self) -> &str {
        match self {
            Notification::LogUpdated { subdomain } => subdomain,
        }
    }
}

/// Broadcast channel for notifications. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Publisher {
    tx: broadcast::Sender<Notification>,
}

impl Publisher {
    /// Creates a bus with the given capacity (clamped to at least 1).
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, notification: Notification) {
        trace!(
            topic = notification.topic(),
            subdomain = notification.subdomain(),
            "publishing"
        );
        let _ = self.tx.send(notification);
    }

    /// Receiver for notifications sent after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}
