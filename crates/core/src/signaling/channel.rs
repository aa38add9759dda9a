use super::{SignalingBus, SubscriberId};
use crate::events::{EventEmitter, Subscription};
use crate::{RealtimeError, Result};
use newme_realtime_types::{
    IceCandidate, ParticipantId, SessionDescription, SessionId, SignalingEnvelope, SignalingMessage,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// An inbound negotiation message and the participant that sent it.
#[derive(Debug, Clone, PartialEq)]
pub struct Signal<T> {
    pub from: ParticipantId,
    pub payload: T,
}

struct Joined {
    session_id: SessionId,
    channel: String,
    subscriber: SubscriberId,
    active: Arc<AtomicBool>,
    pump: JoinHandle<()>,
}

/// Typed relay of session descriptions and candidates for one participant.
pub struct SignalingChannel {
    bus: Arc<dyn SignalingBus>,
    participant: ParticipantId,
    joined: Mutex<Option<Joined>>,
    sdp: EventEmitter<Signal<SessionDescription>>,
    ice: EventEmitter<Signal<IceCandidate>>,
}

impl SignalingChannel {
    pub fn new(bus: Arc<dyn SignalingBus>, participant: ParticipantId) -> Self {
        Self {
            bus,
            participant,
            joined: Mutex::new(None),
            sdp: EventEmitter::new(),
            ice: EventEmitter::new(),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Subscribes to the channel of `session_id`.
    ///
    /// Joining the session already joined is a no-op; joining a different one
    /// leaves the current session first.
    #[instrument(skip(self), fields(participant = %self.participant))]
    pub async fn join(&self, session_id: &SessionId) -> Result<()> {
        let mut joined = self.joined.lock().await;
        if let Some(current) = joined.as_ref() {
            if &current.session_id == session_id {
                debug!("Already joined");
                return Ok(());
            }
        }
        if let Some(previous) = joined.take() {
            self.detach(previous).await;
        }

        let channel = session_id.channel_name();
        let subscription = self.bus.subscribe(&channel).await?;
        let active = Arc::new(AtomicBool::new(true));
        let pump = tokio::spawn(pump_inbound(
            subscription.inbound,
            self.participant.clone(),
            active.clone(),
            self.sdp.clone(),
            self.ice.clone(),
        ));
        info!(%channel, "Joined signaling channel");
        *joined = Some(Joined {
            session_id: session_id.clone(),
            channel,
            subscriber: subscription.id,
            active,
            pump,
        });
        Ok(())
    }

    pub async fn send_sdp(&self, description: SessionDescription) -> Result<()> {
        self.publish(SignalingMessage::Sdp { description }).await
    }

    pub async fn send_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.publish(SignalingMessage::IceCandidate { candidate })
            .await
    }

    pub fn on_sdp<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Signal<SessionDescription>) + Send + Sync + 'static,
    {
        self.sdp.subscribe(observer)
    }

    pub fn on_ice_candidate<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Signal<IceCandidate>) + Send + Sync + 'static,
    {
        self.ice.subscribe(observer)
    }

    pub async fn is_joined(&self) -> bool {
        self.joined.lock().await.is_some()
    }

    /// Unsubscribes. No delivery starts after this returns, but an observer
    /// already running on another thread may still be finishing.
    pub async fn leave(&self) {
        if let Some(joined) = self.joined.lock().await.take() {
            self.detach(joined).await;
        }
    }

    async fn detach(&self, joined: Joined) {
        joined.active.store(false, Ordering::SeqCst);
        joined.pump.abort();
        self.bus.unsubscribe(&joined.channel, joined.subscriber).await;
        info!(channel = %joined.channel, "Left signaling channel");
    }

    async fn publish(&self, message: SignalingMessage) -> Result<()> {
        let (channel, subscriber) = {
            let joined = self.joined.lock().await;
            let joined = joined
                .as_ref()
                .ok_or_else(|| RealtimeError::Signaling("channel not joined".to_string()))?;
            (joined.channel.clone(), joined.subscriber)
        };
        let text = SignalingEnvelope::new(self.participant.clone(), message).to_json()?;
        self.bus.publish(&channel, subscriber, text).await
    }
}

async fn pump_inbound(
    mut inbound: tokio::sync::mpsc::UnboundedReceiver<String>,
    me: ParticipantId,
    active: Arc<AtomicBool>,
    sdp: EventEmitter<Signal<SessionDescription>>,
    ice: EventEmitter<Signal<IceCandidate>>,
) {
    while let Some(text) = inbound.recv().await {
        let envelope = match SignalingEnvelope::from_json(&text) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(error = %e, "Dropping undecodable signaling frame");
                continue;
            }
        };
        if envelope.from == me {
            continue;
        }
        if !active.load(Ordering::SeqCst) {
            break;
        }
        match envelope.message {
            SignalingMessage::Sdp { description } => sdp.emit(&Signal {
                from: envelope.from,
                payload: description,
            }),
            SignalingMessage::IceCandidate { candidate } => ice.emit(&Signal {
                from: envelope.from,
                payload: candidate,
            }),
        }
    }
}
