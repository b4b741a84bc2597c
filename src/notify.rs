//! Notification sink
//!
//! The supervisor and registry report noteworthy events (for now: a
//! device stopping unexpectedly) through a sink trait so embedders can
//! forward them to whatever transport they use. Two implementations ship
//! with the crate: a tracing-backed sink and an in-process channel sink.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

/// Category of a device-stopped notification
pub const DEVICE_STOPPED: &str = "device.stopped";

/// A structured event emitted by the orchestration core
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Unique event id
    pub event_id: Uuid,
    /// Event category, e.g. `device.stopped`
    pub category: String,
    /// Device instance id
    pub device_id: u64,
    /// Device instance name
    pub device_name: String,
    /// Human-readable message
    pub message: String,
    /// Diagnostic details (e.g. emulator log tail)
    pub details: String,
    /// When the event was observed
    pub timestamp: DateTime<Utc>,
}

impl Notification {
    /// Event for a device whose process died or stopped responding
    pub fn device_stopped(
        device_id: u64,
        device_name: String,
        message: String,
        details: String,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            category: DEVICE_STOPPED.to_string(),
            device_id,
            device_name,
            message,
            details,
            timestamp: Utc::now(),
        }
    }
}

/// Destination for structured notifications
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink that logs notifications as structured warnings
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn notify(&self, notification: Notification) {
        let payload = serde_json::to_string(&notification).unwrap_or_default();
        warn!(
            category = %notification.category,
            device = %notification.device_name,
            "{} ({})",
            notification.message,
            payload
        );
    }
}

/// Sink that forwards notifications over an unbounded channel
///
/// Used by embedders that consume events elsewhere, and by tests.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl NotificationSink for ChannelSink {
    fn notify(&self, notification: Notification) {
        // a dropped receiver just means nobody is listening anymore
        let _ = self.tx.send(notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_delivers() {
        let (sink, mut rx) = ChannelSink::new();
        sink.notify(Notification::device_stopped(
            7,
            "PC7".to_string(),
            "PC7 process has stopped running".to_string(),
            String::new(),
        ));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.device_id, 7);
        assert_eq!(received.category, DEVICE_STOPPED);
    }

    #[test]
    fn test_notification_serializes() {
        let n = Notification::device_stopped(1, "PC1".to_string(), "gone".to_string(), "".to_string());
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["device_id"], 1);
        assert_eq!(json["category"], "device.stopped");
    }
}
