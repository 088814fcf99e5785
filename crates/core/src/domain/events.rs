//! Outbound notifications
//!
//! Clipping detections are published fire-and-forget to whoever is listening.
//! Publishing with nobody listening is a successful no-op.

use crate::domain::audio::{AudioError, Result, SourceId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Message shown to the user when a chain is attenuated
pub const CLIPPING_MESSAGE: &str = "Clipping detected, reducing volume to prevent distortion";

/// Relay action name of a clipping notification
pub const CLIPPING_ACTION: &str = "clipping_detected";

/// A chain's gain was reduced to avoid clipping
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClippingDetected {
    pub source: SourceId,
    pub peak: f32,
    pub previous_gain: f32,
    pub new_gain: f32,
    pub message: String,
}

impl ClippingDetected {
    pub fn new(source: SourceId, peak: f32, previous_gain: f32, new_gain: f32) -> Self {
        Self {
            source,
            peak,
            previous_gain,
            new_gain,
            message: CLIPPING_MESSAGE.to_string(),
        }
    }

    /// Message in the form the control surface relay expects
    pub fn to_relay_json(&self) -> String {
        serde_json::json!({
            "action": CLIPPING_ACTION,
            "message": self.message,
        })
        .to_string()
    }
}

/// Observer set for clipping notifications
pub trait Notifier: Send + Sync {
    fn publish(&self, event: ClippingDetected) -> Result<()>;
}

/// Broadcast-backed notifier
///
/// Every subscriber receives every event published after it subscribed.
/// Slow subscribers lose the oldest events once `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct NotificationHub {
    sender: broadcast::Sender<ClippingDetected>,
}

impl NotificationHub {
    pub const DEFAULT_CAPACITY: usize = 64;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClippingDetected> {
        self.sender.subscribe()
    }

    pub fn observer_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl Notifier for NotificationHub {
    fn publish(&self, event: ClippingDetected) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            trace!(source = %event.source, "No observers for clipping notification");
            return Ok(());
        }
        self.sender
            .send(event)
            .map(|_| ())
            .map_err(|e| AudioError::NotificationDeliveryFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_event() -> ClippingDetected {
        ClippingDetected::new(SourceId::new(3), 0.97, 2.0, 1.9)
    }

    #[test]
    fn test_publish_without_observers_is_ok() {
        let hub = NotificationHub::default();
        assert_eq!(hub.observer_count(), 0);
        assert!(hub.publish(create_test_event()).is_ok());
    }

    #[tokio::test]
    async fn test_every_observer_receives() {
        let hub = NotificationHub::default();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        hub.publish(create_test_event()).unwrap();

        assert_eq!(first.recv().await.unwrap().new_gain, 1.9);
        assert_eq!(second.recv().await.unwrap().source, SourceId::new(3));
    }

    #[test]
    fn test_dropped_observer_no_longer_counted() {
        let hub = NotificationHub::default();
        let receiver = hub.subscribe();
        assert_eq!(hub.observer_count(), 1);

        drop(receiver);
        assert_eq!(hub.observer_count(), 0);
        assert!(hub.publish(create_test_event()).is_ok());
    }

    #[test]
    fn test_relay_json() {
        let json: serde_json::Value = serde_json::from_str(&create_test_event().to_relay_json()).unwrap();
        assert_eq!(json["action"], "clipping_detected");
        assert_eq!(json["message"], CLIPPING_MESSAGE);
    }
}
