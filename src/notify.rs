use dashmap::DashMap;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Event;

const CHANNEL_CAPACITY: usize = 256;

/// Change feed. Every committed event is broadcast on its customer's channel
/// and on the tenant-wide channel that list builders watch.
pub struct NotifyHub {
    channels: DashMap<Ulid, broadcast::Sender<Event>>,
    all: broadcast::Sender<Event>,
}

impl Default for NotifyHub {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyHub {
    pub fn new() -> Self {
        Self {
            channels: DashMap::new(),
            all: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    /// Subscribe to one customer's changes. Creates the channel if needed.
    pub fn subscribe(&self, customer_id: Ulid) -> broadcast::Receiver<Event> {
        let sender = self
            .channels
            .entry(customer_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        sender.subscribe()
    }

    pub fn subscribe_all(&self) -> broadcast::Receiver<Event> {
        self.all.subscribe()
    }

    /// No-op if nobody is listening.
    pub fn send(&self, customer_id: Ulid, event: &Event) {
        if let Some(sender) = self.channels.get(&customer_id) {
            let _ = sender.send(event.clone());
        }
        let _ = self.all.send(event.clone());
    }

    /// Drop channels whose receivers have all gone away.
    pub fn prune(&self) {
        self.channels.retain(|_, sender| sender.receiver_count() > 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CustomerStatus;

    #[tokio::test]
    async fn subscribe_and_receive() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        let mut rx = hub.subscribe(cid);
        let mut all = hub.subscribe_all();

        let event = Event::CustomerStatusChanged {
            id: cid,
            status: CustomerStatus::Paused,
        };
        hub.send(cid, &event);

        assert_eq!(rx.recv().await.unwrap(), event);
        assert_eq!(all.recv().await.unwrap(), event);
    }

    #[tokio::test]
    async fn other_customers_are_not_delivered() {
        let hub = NotifyHub::new();
        let mine = Ulid::new();
        let other = Ulid::new();
        let mut rx = hub.subscribe(mine);
        hub.send(
            other,
            &Event::CustomerStatusChanged {
                id: other,
                status: CustomerStatus::Active,
            },
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_without_subscribers_is_noop() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        hub.send(
            cid,
            &Event::CustomerStatusChanged {
                id: cid,
                status: CustomerStatus::Stopped,
            },
        );
    }

    #[tokio::test]
    async fn prune_drops_abandoned_channels() {
        let hub = NotifyHub::new();
        let cid = Ulid::new();
        drop(hub.subscribe(cid));
        hub.prune();
        assert!(hub.channels.is_empty());
    }
}
