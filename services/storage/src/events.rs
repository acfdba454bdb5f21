//! Tier change notifications.
//!
//! Delivery is fire-and-forget: events are published after the catalog commit and
//! a publish failure never undoes a move or delete.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;
use uuid::Uuid;

/// A completed move or delete
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TierEvent {
    Moved {
        recording_id: Uuid,
        camera_id: String,
        category: String,
        from_tier: i32,
        to_tier: i32,
        path: String,
        at: DateTime<Utc>,
    },
    Deleted {
        recording_id: Uuid,
        camera_id: String,
        category: String,
        from_tier: i32,
        at: DateTime<Utc>,
    },
}

impl TierEvent {
    pub fn recording_id(&self) -> Uuid {
        match self {
            TierEvent::Moved { recording_id, .. } | TierEvent::Deleted { recording_id, .. } => {
                *recording_id
            }
        }
    }

    pub fn camera_id(&self) -> &str {
        match self {
            TierEvent::Moved { camera_id, .. } | TierEvent::Deleted { camera_id, .. } => camera_id,
        }
    }

    pub fn from_tier(&self) -> i32 {
        match self {
            TierEvent::Moved { from_tier, .. } | TierEvent::Deleted { from_tier, .. } => *from_tier,
        }
    }

    /// Destination tier, `None` for deletes
    pub fn to_tier(&self) -> Option<i32> {
        match self {
            TierEvent::Moved { to_tier, .. } => Some(*to_tier),
            TierEvent::Deleted { .. } => None,
        }
    }
}

/// Sink for tier events
#[cfg_attr(test, mockall::automock)]
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: TierEvent);
}

/// Publishes on an in-process broadcast channel.
///
/// Bridges to an external bus subscribe with [`BroadcastPublisher::subscribe`].
/// Lagging subscribers lose the oldest events.
#[derive(Clone)]
pub struct BroadcastPublisher {
    sender: broadcast::Sender<TierEvent>,
}

impl BroadcastPublisher {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TierEvent> {
        self.sender.subscribe()
    }
}

impl EventPublisher for BroadcastPublisher {
    fn publish(&self, event: TierEvent) {
        // Err only means nobody is listening
        if self.sender.send(event).is_err() {
            trace!("No tier event subscribers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn deleted() -> TierEvent {
        TierEvent::Deleted {
            recording_id: Uuid::nil(),
            camera_id: "cam1".to_string(),
            category: "recorder".to_string(),
            from_tier: 1,
            at: Utc::now(),
        }
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(deleted()).unwrap();
        assert_eq!(json["type"], "deleted");
        assert_eq!(json["from_tier"], 1);
        assert!(json.get("to_tier").is_none());
    }

    #[test]
    fn test_event_accessors() {
        let event = deleted();
        assert_eq!(event.camera_id(), "cam1");
        assert_eq!(event.from_tier(), 1);
        assert_eq!(event.to_tier(), None);
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_subscribers() {
        let publisher = BroadcastPublisher::new(8);
        let mut rx = publisher.subscribe();

        publisher.publish(deleted());

        let event = rx.recv().await.unwrap();
        assert_eq!(event.recording_id(), Uuid::nil());
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        BroadcastPublisher::new(8).publish(deleted());
    }
}
