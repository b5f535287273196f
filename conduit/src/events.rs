use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::correlation::CorrelationId;
use crate::item::{ItemId, QueueItem};
use crate::lease::LeaseId;

/// Metadata envelope attached to every item event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub version: u16,
    pub correlation_id: CorrelationId,
    pub item_id: ItemId,
    pub queue_name: String,
    pub timestamp: DateTime<Utc>,
}

impl EventMeta {
    pub fn for_item(item: &QueueItem, timestamp: DateTime<Utc>) -> Self {
        Self {
            version: 1,
            correlation_id: item.correlation_id.clone(),
            item_id: item.id,
            queue_name: item.queue_name.clone(),
            timestamp,
        }
    }
}

/// Item lifecycle event with metadata and payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ItemEvent {
    pub meta: EventMeta,
    pub payload: ItemEventPayload,
}

impl ItemEvent {
    pub fn new(item: &QueueItem, timestamp: DateTime<Utc>, payload: ItemEventPayload) -> Self {
        Self {
            meta: EventMeta::for_item(item, timestamp),
            payload,
        }
    }
}

/// Event payload emitted for item lifecycle transitions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[non_exhaustive]
pub enum ItemEventPayload {
    Enqueued {
        priority: i32,
        dependency: String,
    },
    /// Item was claimed and assigned a lease.
    Claimed {
        lease_id: LeaseId,
        worker_id: String,
    },
    LeaseRenewed {
        lease_id: LeaseId,
        expires_at: DateTime<Utc>,
    },
    Completed {
        attempt_count: u32,
    },
    /// Attempt failed and the item went back to pending.
    RetryScheduled {
        attempt_count: u32,
        scheduled_at: DateTime<Utc>,
        error: String,
    },
    DeadLettered {
        attempt_count: u32,
        error: String,
    },
    /// No handler was registered for the item's queue.
    Failed {
        error: String,
    },
    LeaseExpired {
        lease_id: LeaseId,
        dead_lettered: bool,
    },
}

/// Trait for publishing item lifecycle events.
#[async_trait]
pub trait ItemEventPublisher: Send + Sync {
    /// Publish an event. Having no subscribers is not an error.
    async fn publish(&self, event: ItemEvent) -> anyhow::Result<()>;

    fn subscribe(&self) -> broadcast::Receiver<ItemEvent>;
}

/// In-process event bus using tokio broadcast channels.
///
/// Publishing never waits for slow subscribers. A subscriber that falls more
/// than `capacity` events behind receives `RecvError::Lagged` and resumes
/// with the oldest retained event.
pub struct InProcEventBus {
    sender: broadcast::Sender<ItemEvent>,
    capacity: usize,
}

impl std::fmt::Debug for InProcEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcEventBus")
            .field("capacity", &self.capacity)
            .field("subscribers", &self.sender.receiver_count())
            .finish()
    }
}

impl Default for InProcEventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl InProcEventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[async_trait]
impl ItemEventPublisher for InProcEventBus {
    async fn publish(&self, event: ItemEvent) -> anyhow::Result<()> {
        let _ = self.sender.send(event);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ItemEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::item::EnqueueRequest;
    use serde_json::json;
    use std::time::Duration;
    use tokio::time::timeout;

    fn item() -> QueueItem {
        let new = EnqueueRequest::new("klaviyo_sync", json!({"event_id": 9}))
            .validate(&QueueConfig::default(), Utc::now())
            .unwrap();
        QueueItem::from_new(new, 1)
    }

    fn enqueued(item: &QueueItem) -> ItemEvent {
        ItemEvent::new(
            item,
            Utc::now(),
            ItemEventPayload::Enqueued {
                priority: item.priority,
                dependency: item.dependency.clone(),
            },
        )
    }

    #[tokio::test]
    async fn test_event_bus_broadcast_to_multiple_subscribers() {
        let bus = InProcEventBus::new(100);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        let item = item();
        for _ in 0..5 {
            bus.publish(enqueued(&item)).await.unwrap();
        }

        for _ in 0..5 {
            let a = timeout(Duration::from_millis(100), rx1.recv()).await.unwrap().unwrap();
            let b = timeout(Duration::from_millis(100), rx2.recv()).await.unwrap().unwrap();
            assert_eq!(a.meta.item_id, item.id);
            assert_eq!(a, b);
        }
    }

    #[tokio::test]
    async fn test_lagged_subscriber_doesnt_block_publisher() {
        let bus = InProcEventBus::new(2);
        let mut rx = bus.subscribe();

        let item = item();
        for _ in 0..5 {
            bus.publish(enqueued(&item)).await.unwrap();
        }

        let result = timeout(Duration::from_millis(100), rx.recv()).await.unwrap();
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(3))));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = InProcEventBus::default();
        assert!(bus.publish(enqueued(&item())).await.is_ok());
    }

    #[test]
    fn test_event_bus_debug_format() {
        let bus = InProcEventBus::new(100);
        let _rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();

        let debug_str = format!("{:?}", bus);
        assert!(debug_str.contains("InProcEventBus"));
        assert!(debug_str.contains("subscribers: 2"));
        assert!(debug_str.contains("capacity: 100"));
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let item = item();
        let event = ItemEvent::new(
            &item,
            Utc::now(),
            ItemEventPayload::DeadLettered {
                attempt_count: 3,
                error: "HTTP 503".into(),
            },
        );
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["payload"]["type"], "dead_lettered");
        assert_eq!(value["meta"]["queue_name"], "klaviyo_sync");
    }
}
