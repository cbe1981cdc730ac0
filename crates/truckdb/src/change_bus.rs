//! Multicast change-notification bus. A multicast broadcaster with a
//! bounded queue per subscriber; a subscriber that falls behind drops
//! events (observed as `Lagged` on its receiver) rather than back-pressuring
//! the write path, matching the storage engine's change-bus design notes.

use tokio::sync::broadcast;

use crate::value::Value;

const DEFAULT_BUFFER_SIZE: usize = 1024;

/// One committed or buffered mutation, as delivered to change-bus
/// subscribers. Every variant carries at least `truck_id`/`box_id`.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Put {
        truck_id: String,
        box_id: String,
        tag: String,
        value: Value,
    },
    Update {
        truck_id: String,
        box_id: String,
        tag: String,
        value: Value,
    },
    Delete {
        truck_id: String,
        box_id: String,
        tag: String,
    },
    DeleteBox {
        truck_id: String,
        box_id: String,
    },
    Batch {
        truck_id: String,
        box_id: String,
        entries: Vec<String>,
    },
    CasUpdate {
        truck_id: String,
        box_id: String,
        tag: String,
        value: Value,
    },
}

impl ChangeEvent {
    pub fn truck_id(&self) -> &str {
        match self {
            ChangeEvent::Put { truck_id, .. }
            | ChangeEvent::Update { truck_id, .. }
            | ChangeEvent::Delete { truck_id, .. }
            | ChangeEvent::DeleteBox { truck_id, .. }
            | ChangeEvent::Batch { truck_id, .. }
            | ChangeEvent::CasUpdate { truck_id, .. } => truck_id,
        }
    }

    pub fn box_id(&self) -> &str {
        match self {
            ChangeEvent::Put { box_id, .. }
            | ChangeEvent::Update { box_id, .. }
            | ChangeEvent::Delete { box_id, .. }
            | ChangeEvent::DeleteBox { box_id, .. }
            | ChangeEvent::Batch { box_id, .. }
            | ChangeEvent::CasUpdate { box_id, .. } => box_id,
        }
    }

    /// Whether this event affects `tag`: a direct single-tag op on that
    /// tag, a batch that touched it, or a box-wide delete.
    pub fn affects_tag(&self, tag: &str) -> bool {
        match self {
            ChangeEvent::Put { tag: t, .. }
            | ChangeEvent::Update { tag: t, .. }
            | ChangeEvent::Delete { tag: t, .. }
            | ChangeEvent::CasUpdate { tag: t, .. } => t == tag,
            ChangeEvent::DeleteBox { .. } => true,
            ChangeEvent::Batch { entries, .. } => entries.iter().any(|t| t == tag),
        }
    }
}

/// A multicast broadcaster of [`ChangeEvent`]s.
#[derive(Debug, Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new(buffer_size: usize) -> Self {
        let (tx, _rx) = broadcast::channel(buffer_size);
        Self { tx }
    }

    /// Publishes an event; returns the number of subscribers it was
    /// delivered to. Ignores the "no subscribers" error, since publishing
    /// with nobody listening is a normal, expected occurrence.
    pub fn publish(&self, event: ChangeEvent) -> usize {
        self.tx.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put_event() -> ChangeEvent {
        ChangeEvent::Put {
            truck_id: "t".to_string(),
            box_id: "users".to_string(),
            tag: "u1".to_string(),
            value: Value::Null,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_event() {
        let bus = ChangeBus::new(8);
        let mut rx = bus.subscribe();
        bus.publish(put_event());
        let event = rx.recv().await.unwrap();
        assert_eq!(event.box_id(), "users");
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = ChangeBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);
        assert_eq!(bus.publish(put_event()), 2);
        assert!(rx1.recv().await.is_ok());
        assert!(rx2.recv().await.is_ok());
    }

    #[tokio::test]
    async fn lagging_subscriber_observes_lagged_error() {
        let bus = ChangeBus::new(2);
        let mut rx = bus.subscribe();
        for _ in 0..5 {
            bus.publish(put_event());
        }
        let result = rx.recv().await;
        assert!(matches!(result, Err(broadcast::error::RecvError::Lagged(_))));
    }

    #[test]
    fn affects_tag_matches_batch_entries() {
        let event = ChangeEvent::Batch {
            truck_id: "t".to_string(),
            box_id: "b".to_string(),
            entries: vec!["a".to_string(), "b".to_string()],
        };
        assert!(event.affects_tag("a"));
        assert!(!event.affects_tag("z"));
    }

    #[test]
    fn delete_box_affects_every_tag() {
        let event = ChangeEvent::DeleteBox {
            truck_id: "t".to_string(),
            box_id: "b".to_string(),
        };
        assert!(event.affects_tag("anything"));
    }
}
