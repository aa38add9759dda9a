//! Shared relay state: the rooms and the sockets joined to each.

use axum::extract::ws::Message;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;

pub type ClientId = u64;

/// Outbound queue of one connected socket.
pub type ClientSender = mpsc::UnboundedSender<Message>;

/// Channel-name keyed rooms of connected sockets.
#[derive(Default)]
pub struct Rooms {
    rooms: Mutex<HashMap<String, HashMap<ClientId, ClientSender>>>,
    next_client: AtomicU64,
}

impl Rooms {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a socket to `room`, creating the room on first use.
    pub fn join(&self, room: &str) -> (ClientId, mpsc::UnboundedReceiver<Message>) {
        let id = self.next_client.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.rooms
            .lock()
            .entry(room.to_string())
            .or_default()
            .insert(id, tx);
        (id, rx)
    }

    /// Removes a socket; the room goes away with its last member.
    pub fn leave(&self, room: &str, client: ClientId) {
        let mut rooms = self.rooms.lock();
        if let Some(members) = rooms.get_mut(room) {
            members.remove(&client);
            if members.is_empty() {
                rooms.remove(room);
            }
        }
    }

    /// Queues `message` for every member of `room` except `from`. Returns the
    /// number of recipients.
    pub fn relay(&self, room: &str, from: ClientId, message: Message) -> usize {
        let rooms = self.rooms.lock();
        let Some(members) = rooms.get(room) else {
            return 0;
        };
        members
            .iter()
            .filter(|(id, _)| **id != from)
            .filter(|(_, tx)| tx.send(message.clone()).is_ok())
            .count()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.lock().len()
    }

    pub fn member_count(&self, room: &str) -> usize {
        self.rooms.lock().get(room).map_or(0, HashMap::len)
    }
}

/// The shared application state, created once at startup and passed to all handlers.
#[derive(Clone, Default)]
pub struct AppState {
    pub rooms: Arc<Rooms>,
}

impl AppState {
    pub fn new() -> Self {
        Self::default()
    }
}
