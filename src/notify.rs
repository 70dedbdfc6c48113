//! Outbound notification streams.

use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::{debug, warn};

pub const UPDATE_RESPONSE_EVENT: &str = "update_manager:update_response";
pub const UPDATE_REFRESHED_EVENT: &str = "update_manager:update_refreshed";
pub const WARNING_EVENT: &str = "update_manager:warning";

pub trait NotificationSink: Send + Sync {
    fn emit(&self, event: &str, payload: Value);

    /// Persistent warning surfaced to the device owner.
    fn warn(&self, message: &str) {
        warn!(message, "Update manager warning");
    }
}

/// Sink that only logs; used when nothing is listening.
#[derive(Debug, Default, Clone)]
pub struct TracingSink;

impl NotificationSink for TracingSink {
    fn emit(&self, event: &str, payload: Value) {
        debug!(event, %payload, "Notification");
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub event: String,
    pub payload: Value,
}

/// Fans notifications out to any number of subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl NotificationSink for BroadcastSink {
    fn emit(&self, event: &str, payload: Value) {
        debug!(event, %payload, "Notification");
        // No subscribers is not an error.
        let _ = self.tx.send(Notification {
            event: event.to_string(),
            payload,
        });
    }

    fn warn(&self, message: &str) {
        warn!(message, "Update manager warning");
        let _ = self.tx.send(Notification {
            event: WARNING_EVENT.to_string(),
            payload: json!({ "message": message }),
        });
    }
}
