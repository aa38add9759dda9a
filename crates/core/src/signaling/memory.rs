use super::{BusSubscription, SignalingBus, SubscriberId};
use crate::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tracing::{debug, trace};

type Room = HashMap<SubscriberId, mpsc::UnboundedSender<String>>;

/// In-process bus; every participant sharing the instance shares its rooms.
#[derive(Clone, Default)]
pub struct MemoryBus {
    rooms: Arc<Mutex<HashMap<String, Room>>>,
    next_id: Arc<AtomicU64>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.rooms.lock().get(channel).map_or(0, HashMap::len)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }
}

#[async_trait]
impl SignalingBus for MemoryBus {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        let mut rooms = self.rooms.lock();
        let room = rooms.entry(channel.to_string()).or_default();
        room.insert(id, tx);
        debug!(channel, subscriber = id, members = room.len(), "Joined room");
        Ok(BusSubscription { id, inbound: rx })
    }

    async fn publish(&self, channel: &str, from: SubscriberId, text: String) -> Result<()> {
        let rooms = self.rooms.lock();
        if let Some(room) = rooms.get(channel) {
            for (&id, sender) in room.iter() {
                if id != from {
                    let _ = sender.send(text.clone());
                }
            }
            trace!(channel, from, recipients = room.len().saturating_sub(1), "Relayed frame");
        }
        Ok(())
    }

    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId) {
        let mut rooms = self.rooms.lock();
        if let Some(room) = rooms.get_mut(channel) {
            room.remove(&subscriber);
            if room.is_empty() {
                rooms.remove(channel);
                debug!(channel, "Room removed (empty)");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_everyone_but_sender() {
        let bus = MemoryBus::new();
        let mut a = bus.subscribe("room").await.unwrap();
        let mut b = bus.subscribe("room").await.unwrap();
        let mut c = bus.subscribe("room").await.unwrap();

        bus.publish("room", a.id, "one".to_string()).await.unwrap();
        bus.publish("room", a.id, "two".to_string()).await.unwrap();

        assert_eq!(b.inbound.recv().await.unwrap(), "one");
        assert_eq!(b.inbound.recv().await.unwrap(), "two");
        assert_eq!(c.inbound.recv().await.unwrap(), "one");
        assert!(a.inbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_rooms_are_isolated_and_removed_when_empty() {
        let bus = MemoryBus::new();
        let a = bus.subscribe("room-1").await.unwrap();
        let mut other = bus.subscribe("room-2").await.unwrap();

        bus.publish("room-1", a.id, "hello".to_string()).await.unwrap();
        assert!(other.inbound.try_recv().is_err());
        assert_eq!(bus.room_count(), 2);

        bus.unsubscribe("room-1", a.id).await;
        assert_eq!(bus.subscriber_count("room-1"), 0);
        assert_eq!(bus.room_count(), 1);

        bus.unsubscribe("room-1", a.id).await;
        bus.publish("room-1", a.id, "late".to_string()).await.unwrap();
    }
}
