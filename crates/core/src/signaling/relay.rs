use super::{BusSubscription, SignalingBus, SubscriberId};
use crate::{RealtimeError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message as WsMessage};
use tracing::{debug, info, warn};

struct RelayLink {
    outbound: mpsc::UnboundedSender<WsMessage>,
    reader: JoinHandle<()>,
}

/// Bus backed by the signaling relay service.
///
/// Each subscription is its own WebSocket to `{base_url}/{channel}`; the relay
/// fans frames out to the other sockets in that room.
#[derive(Clone)]
pub struct RelayBus {
    base_url: String,
    links: Arc<Mutex<HashMap<SubscriberId, RelayLink>>>,
    next_id: Arc<AtomicU64>,
}

impl RelayBus {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            links: Arc::new(Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn channel_url(&self, channel: &str) -> String {
        format!("{}/{}", self.base_url, channel)
    }
}

#[async_trait]
impl SignalingBus for RelayBus {
    async fn subscribe(&self, channel: &str) -> Result<BusSubscription> {
        let url = self.channel_url(channel);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| RealtimeError::Signaling(format!("connect {}: {}", url, e)))?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        info!(channel, subscriber = id, "Connected to signaling relay");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<WsMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, WsMessage::Close(_));
                if ws_tx.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();
        let channel_name = channel.to_string();
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(WsMessage::Text(text)) => {
                        if in_tx.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(WsMessage::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!(channel = %channel_name, error = %e, "Signaling relay read failed");
                        break;
                    }
                }
            }
            debug!(channel = %channel_name, "Signaling relay reader finished");
        });

        self.links.lock().insert(
            id,
            RelayLink {
                outbound: out_tx,
                reader,
            },
        );
        Ok(BusSubscription { id, inbound: in_rx })
    }

    async fn publish(&self, channel: &str, from: SubscriberId, text: String) -> Result<()> {
        let links = self.links.lock();
        let link = links.get(&from).ok_or_else(|| {
            RealtimeError::Signaling(format!("not subscribed to {}", channel))
        })?;
        link.outbound
            .send(WsMessage::Text(text.into()))
            .map_err(|_| RealtimeError::Signaling(format!("relay connection for {} closed", channel)))
    }

    async fn unsubscribe(&self, channel: &str, subscriber: SubscriberId) {
        if let Some(link) = self.links.lock().remove(&subscriber) {
            let _ = link.outbound.send(WsMessage::Close(None));
            link.reader.abort();
            debug!(channel, subscriber, "Left signaling relay");
        }
    }
}
