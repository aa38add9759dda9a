//! Session-keyed relay of negotiation messages.
//!
//! The [`SignalingBus`] is the publish/subscribe primitive underneath: named
//! channels of opaque text frames, delivered to every subscriber except the
//! publisher. [`SignalingChannel`] layers the typed envelope protocol on top.

mod channel;
mod memory;
mod relay;

pub use channel::{Signal, SignalingChannel};
pub use memory::MemoryBus;
pub use relay::RelayBus;

use crate::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Identifies one subscription on a bus.
pub type SubscriberId = u64;

/// An open subscription: inbound frames published by everyone else.
#[derive(Debug)]
pub struct BusSubscription {
    pub id: SubscriberId,
    pub inbound: mpsc::UnboundedReceiver<String>,
}

#[async_trait]
pub trait SignalingBus: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription>;

    /// Delivers `text` to every other subscriber of `channel`, best effort.
    async fn publish(&self, channel: &str, from: SubscriberId, text: String) -> Result<()>;

    /// Closes a subscription. Unknown ids are ignored.
    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId);
}
