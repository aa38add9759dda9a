use super::{
    BackendConnectionState, BackendEvent, DATA_CHANNEL_LABEL, PeerBackend, PeerBackendFactory,
    TrackId,
};
use crate::capture::Microphone;
use crate::events::{EventEmitter, Subscription};
use crate::signaling::{Signal, SignalingChannel};
use crate::{RealtimeError, Result};
use newme_realtime_types::{
    ApplicationMessage, IceCandidate, ParticipantId, PeerState, SdpKind, SessionDescription,
};
use std::sync::{Arc, Weak};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

#[derive(Default)]
struct PeerEvents {
    connect: EventEmitter<()>,
    disconnect: EventEmitter<PeerState>,
    message: EventEmitter<ApplicationMessage>,
    state: EventEmitter<PeerState>,
}

/// State reachable from both the manager and its backend event pump.
struct Shared {
    local: ParticipantId,
    signaling: Arc<SignalingChannel>,
    state: parking_lot::Mutex<PeerState>,
    /// Candidates gathered by the current connection, for re-announcement.
    local_candidates: parking_lot::Mutex<Vec<IceCandidate>>,
    events: PeerEvents,
}

impl Shared {
    fn state(&self) -> PeerState {
        *self.state.lock()
    }

    /// Applies a state change if it is legal from the current state, then
    /// notifies observers outside the lock.
    fn transition(&self, next: PeerState) {
        let previous = {
            let mut state = self.state.lock();
            let current = *state;
            if !peer_transition_allowed(current, next) {
                if current != next {
                    debug!(from = ?current, to = ?next, "Ignoring peer state change");
                }
                return;
            }
            *state = next;
            current
        };
        info!(from = ?previous, to = ?next, "Peer state changed");
        self.events.state.emit(&next);
        if next == PeerState::Connected {
            self.events.connect.emit(&());
        }
        if previous == PeerState::Connected && next != PeerState::Connected {
            self.events.disconnect.emit(&next);
        }
    }
}

fn peer_transition_allowed(current: PeerState, next: PeerState) -> bool {
    use PeerState::*;
    match (current, next) {
        (Closed, _) => false,
        (_, Closed) => true,
        (Disconnected | Failed, _) => false,
        (New, Negotiating | Failed) => true,
        (Negotiating, Connected | Disconnected | Failed) => true,
        (Connected, Disconnected | Failed) => true,
        _ => false,
    }
}

#[derive(Default)]
struct Inner {
    backend: Option<Arc<dyn PeerBackend>>,
    pump: Option<JoinHandle<()>>,
    local_offer: Option<SessionDescription>,
    answered_offer: Option<(ParticipantId, String)>,
    remote_set: bool,
    pending: Vec<IceCandidate>,
    audio_track: Option<TrackId>,
}

/// Owns one peer connection and its negotiation.
///
/// Offer collisions are settled by participant id: the side with the smaller
/// id keeps its offer, the other side discards its connection and answers.
pub struct PeerConnectionManager {
    shared: Arc<Shared>,
    factory: Arc<dyn PeerBackendFactory>,
    microphone: Arc<dyn Microphone>,
    inner: Mutex<Inner>,
}

impl PeerConnectionManager {
    pub fn new(
        local: ParticipantId,
        signaling: Arc<SignalingChannel>,
        factory: Arc<dyn PeerBackendFactory>,
        microphone: Arc<dyn Microphone>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                local,
                signaling,
                state: parking_lot::Mutex::new(PeerState::New),
                local_candidates: parking_lot::Mutex::new(Vec::new()),
                events: PeerEvents::default(),
            }),
            factory,
            microphone,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn state(&self) -> PeerState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == PeerState::Connected
    }

    /// Whether this side yields when its offer collides with `remote`'s.
    pub fn is_polite_towards(&self, remote: &ParticipantId) -> bool {
        self.shared.local > *remote
    }

    /// Begins negotiation. The offerer opens the data channel and sends an
    /// offer; the answerer waits for one. A second `start(true)` while an
    /// offer is outstanding sends nothing.
    #[instrument(skip(self), fields(participant = %self.shared.local))]
    pub async fn start(&self, is_offerer: bool) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.state() == PeerState::Closed {
            return Err(RealtimeError::Negotiation(
                "peer connection is closed".to_string(),
            ));
        }
        if !is_offerer {
            debug!("Waiting for a remote offer");
            return Ok(());
        }
        if inner.local_offer.is_some() {
            debug!("Offer already outstanding");
            return Ok(());
        }
        let result = self.send_offer(&mut inner).await;
        self.fail_on_error(result)
    }

    async fn send_offer(&self, inner: &mut Inner) -> Result<()> {
        let backend = self.ensure_backend(inner).await?;
        backend.create_data_channel(DATA_CHANNEL_LABEL).await?;
        let offer = backend.create_offer().await?;
        inner.local_offer = Some(offer.clone());
        self.shared.transition(PeerState::Negotiating);
        self.shared.signaling.send_sdp(offer).await?;
        info!("Sent offer");
        Ok(())
    }

    /// Applies a remote description, answering offers.
    #[instrument(skip_all, fields(participant = %self.shared.local, from = %signal.from, kind = ?signal.payload.kind))]
    pub async fn handle_sdp(&self, signal: &Signal<SessionDescription>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.state() == PeerState::Closed {
            debug!("Ignoring description on a closed connection");
            return Ok(());
        }
        let result = match signal.payload.kind {
            SdpKind::Offer => self.accept_offer(&mut inner, signal).await,
            SdpKind::Answer | SdpKind::Pranswer => self.accept_answer(&mut inner, signal).await,
            SdpKind::Rollback => {
                debug!("Ignoring rollback");
                Ok(())
            }
        };
        self.fail_on_error(result)
    }

    async fn accept_offer(&self, inner: &mut Inner, signal: &Signal<SessionDescription>) -> Result<()> {
        if inner
            .answered_offer
            .as_ref()
            .is_some_and(|(from, sdp)| *from == signal.from && *sdp == signal.payload.sdp)
        {
            debug!("Ignoring repeated offer");
            return Ok(());
        }
        if let Some(offer) = inner.local_offer.clone() {
            if !self.is_polite_towards(&signal.from) {
                // The remote side may have joined after our offer went out.
                info!("Offer collision, keeping local offer");
                self.announce_offer(offer).await?;
                return Ok(());
            }
            info!("Offer collision, yielding to remote offer");
            self.discard_backend(inner).await;
        }
        let backend = self.ensure_backend(inner).await?;
        self.shared.transition(PeerState::Negotiating);
        backend.set_remote_description(signal.payload.clone()).await?;
        inner.remote_set = true;
        Self::flush_candidates(inner, &backend).await;
        let answer = backend.create_answer().await?;
        inner.answered_offer = Some((signal.from.clone(), signal.payload.sdp.clone()));
        self.shared.signaling.send_sdp(answer).await?;
        info!("Sent answer");
        Ok(())
    }

    /// Sends `offer` again with every candidate gathered so far.
    async fn announce_offer(&self, offer: SessionDescription) -> Result<()> {
        self.shared.signaling.send_sdp(offer).await?;
        let candidates = self.shared.local_candidates.lock().clone();
        for candidate in candidates {
            self.shared.signaling.send_ice_candidate(candidate).await?;
        }
        debug!("Re-sent local offer");
        Ok(())
    }

    async fn accept_answer(&self, inner: &mut Inner, signal: &Signal<SessionDescription>) -> Result<()> {
        let backend = match (&inner.backend, &inner.local_offer) {
            (Some(backend), Some(_)) => backend.clone(),
            _ => {
                debug!("Ignoring answer without an outstanding offer");
                return Ok(());
            }
        };
        backend.set_remote_description(signal.payload.clone()).await?;
        if signal.payload.kind == SdpKind::Answer {
            inner.local_offer = None;
        }
        inner.remote_set = true;
        Self::flush_candidates(inner, &backend).await;
        Ok(())
    }

    /// Applies a remote candidate, or buffers it until a remote description
    /// is installed.
    pub async fn handle_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.state() == PeerState::Closed {
            return Ok(());
        }
        match (&inner.backend, inner.remote_set) {
            (Some(backend), true) => {
                if let Err(e) = backend.add_ice_candidate(candidate).await {
                    warn!(error = %e, "Remote candidate rejected");
                }
            }
            _ => {
                debug!(buffered = inner.pending.len() + 1, "Buffering early candidate");
                inner.pending.push(candidate);
            }
        }
        Ok(())
    }

    async fn flush_candidates(inner: &mut Inner, backend: &Arc<dyn PeerBackend>) {
        for candidate in inner.pending.drain(..) {
            if let Err(e) = backend.add_ice_candidate(candidate).await {
                warn!(error = %e, "Buffered candidate rejected");
            }
        }
    }

    /// Sends over the data channel; dropped silently when it is not open.
    pub async fn send_message(&self, message: &ApplicationMessage) {
        let backend = self.inner.lock().await.backend.clone();
        let Some(backend) = backend.filter(|b| b.data_channel_open()) else {
            debug!("Data channel not open, dropping message");
            return;
        };
        let text = match serde_json::to_string(message) {
            Ok(text) => text,
            Err(e) => {
                warn!(error = %e, "Failed to encode message");
                return;
            }
        };
        if let Err(e) = backend.send_text(text).await {
            warn!(error = %e, "Data channel send failed");
        }
    }

    /// Attaches a microphone track, replacing any current one.
    #[instrument(skip(self), fields(participant = %self.shared.local))]
    pub async fn start_audio(&self, device_id: Option<&str>) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let backend = match (&inner.backend, self.state()) {
            (Some(backend), state) if !state.is_terminal() => backend.clone(),
            _ => {
                return Err(RealtimeError::Negotiation(
                    "no peer connection to attach audio to".to_string(),
                ));
            }
        };
        if let Some(track) = inner.audio_track.take() {
            backend.remove_audio_track(track).await?;
        }
        let capture = self.microphone.open(device_id)?;
        let device = capture.device().id.clone();
        let track = backend.add_audio_track(capture).await?;
        inner.audio_track = Some(track);
        info!(%device, track, "Audio track attached");
        Ok(())
    }

    pub async fn stop_audio(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let (Some(track), Some(backend)) = (inner.audio_track.take(), inner.backend.clone()) {
            backend.remove_audio_track(track).await?;
            info!(track, "Audio track detached");
        }
        Ok(())
    }

    pub async fn has_audio(&self) -> bool {
        self.inner.lock().await.audio_track.is_some()
    }

    /// Releases the connection and any capture device. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if self.state() == PeerState::Closed {
            return;
        }
        self.discard_backend(&mut inner).await;
        inner.pending.clear();
        self.shared.transition(PeerState::Closed);
    }

    pub fn on_connect<F>(&self, observer: F) -> Subscription
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.shared.events.connect.subscribe(move |_| observer())
    }

    /// Fires when an established connection ends, with the state it ended in.
    pub fn on_disconnect<F>(&self, observer: F) -> Subscription
    where
        F: Fn(PeerState) + Send + Sync + 'static,
    {
        self.shared.events.disconnect.subscribe(move |s| observer(*s))
    }

    pub fn on_message<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ApplicationMessage) + Send + Sync + 'static,
    {
        self.shared.events.message.subscribe(observer)
    }

    pub fn on_state<F>(&self, observer: F) -> Subscription
    where
        F: Fn(PeerState) + Send + Sync + 'static,
    {
        self.shared.events.state.subscribe(move |s| observer(*s))
    }

    /// Routes the signaling channel's inbound messages into this manager,
    /// in arrival order.
    pub fn bind_signaling(self: &Arc<Self>) -> SignalingBinding {
        let (tx, mut rx) = mpsc::unbounded_channel::<Inbound>();
        let sdp_tx = tx.clone();
        let sdp = self.shared.signaling.on_sdp(move |signal| {
            let _ = sdp_tx.send(Inbound::Sdp(signal.clone()));
        });
        let ice = self.shared.signaling.on_ice_candidate(move |signal| {
            let _ = tx.send(Inbound::Candidate(signal.payload.clone()));
        });

        let manager: Weak<Self> = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            while let Some(inbound) = rx.recv().await {
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let result = match inbound {
                    Inbound::Sdp(signal) => manager.handle_sdp(&signal).await,
                    Inbound::Candidate(candidate) => manager.handle_ice_candidate(candidate).await,
                };
                if let Err(e) = result {
                    warn!(error = %e, "Failed to apply signaling message");
                }
            }
        });

        SignalingBinding {
            subscriptions: vec![sdp, ice],
            task,
        }
    }

    async fn ensure_backend(&self, inner: &mut Inner) -> Result<Arc<dyn PeerBackend>> {
        if let Some(backend) = &inner.backend {
            return Ok(backend.clone());
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let backend = self.factory.create(tx).await?;
        inner.pump = Some(tokio::spawn(pump_backend_events(self.shared.clone(), rx)));
        inner.backend = Some(backend.clone());
        Ok(backend)
    }

    async fn discard_backend(&self, inner: &mut Inner) {
        if let Some(pump) = inner.pump.take() {
            pump.abort();
        }
        if let Some(backend) = inner.backend.take() {
            if let Err(e) = backend.close().await {
                warn!(error = %e, "Peer connection did not close cleanly");
            }
        }
        inner.local_offer = None;
        inner.answered_offer = None;
        inner.remote_set = false;
        self.shared.local_candidates.lock().clear();
        inner.audio_track = None;
    }

    fn fail_on_error(&self, result: Result<()>) -> Result<()> {
        if let Err(e) = &result {
            warn!(error = %e, "Negotiation step failed");
            self.shared.transition(PeerState::Failed);
        }
        result
    }
}

enum Inbound {
    Sdp(Signal<SessionDescription>),
    Candidate(IceCandidate),
}

/// Keeps a manager subscribed to its signaling channel.
pub struct SignalingBinding {
    subscriptions: Vec<Subscription>,
    task: JoinHandle<()>,
}

impl SignalingBinding {
    pub fn detach(self) {
        for subscription in self.subscriptions {
            subscription.unsubscribe();
        }
        self.task.abort();
    }
}

async fn pump_backend_events(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<BackendEvent>) {
    while let Some(event) = events.recv().await {
        match event {
            BackendEvent::LocalCandidate(candidate) => {
                shared.local_candidates.lock().push(candidate.clone());
                if let Err(e) = shared.signaling.send_ice_candidate(candidate).await {
                    warn!(error = %e, "Failed to send local candidate");
                }
            }
            BackendEvent::ConnectionState(state) => {
                let next = match state {
                    BackendConnectionState::New => continue,
                    BackendConnectionState::Connecting => PeerState::Negotiating,
                    BackendConnectionState::Connected => PeerState::Connected,
                    BackendConnectionState::Disconnected | BackendConnectionState::Closed => {
                        PeerState::Disconnected
                    }
                    BackendConnectionState::Failed => PeerState::Failed,
                };
                shared.transition(next);
            }
            BackendEvent::DataChannelOpen => debug!("Data channel open"),
            BackendEvent::DataChannelClosed => debug!("Data channel closed"),
            BackendEvent::DataMessage(text) => {
                match serde_json::from_str::<ApplicationMessage>(&text) {
                    Ok(message) => shared.events.message.emit(&message),
                    Err(e) => warn!(error = %e, "Dropping malformed data-channel message"),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::VirtualMicrophone;
    use crate::signaling::{MemoryBus, SignalingBus};
    use crate::testing::{FakeNetwork, FakePeerFactory, wait_until};
    use newme_realtime_types::SessionId;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Side {
        manager: Arc<PeerConnectionManager>,
        factory: FakePeerFactory,
        channel: Arc<SignalingChannel>,
        _binding: SignalingBinding,
    }

    async fn side(
        bus: &MemoryBus,
        name: &str,
        network: FakeNetwork,
        microphone: Arc<VirtualMicrophone>,
    ) -> Side {
        let shared_bus: Arc<dyn SignalingBus> = Arc::new(bus.clone());
        let channel = Arc::new(SignalingChannel::new(shared_bus, ParticipantId::from(name)));
        channel.join(&SessionId::from("sess-1")).await.unwrap();
        let factory = FakePeerFactory::new(network);
        let manager = Arc::new(PeerConnectionManager::new(
            ParticipantId::from(name),
            channel.clone(),
            Arc::new(factory.clone()),
            microphone,
        ));
        let binding = manager.bind_signaling();
        Side {
            manager,
            factory,
            channel,
            _binding: binding,
        }
    }

    #[tokio::test]
    async fn test_single_offerer_negotiates_and_connects() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let b = side(&bus, "bob", FakeNetwork::Healthy, mic).await;

        let connects = Arc::new(AtomicUsize::new(0));
        let counter = connects.clone();
        let _sub = a.manager.on_connect(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        a.manager.start(true).await.unwrap();
        a.manager.start(true).await.unwrap();
        b.manager.start(false).await.unwrap();

        wait_until(|| a.manager.is_connected() && b.manager.is_connected()).await;
        assert_eq!(connects.load(Ordering::SeqCst), 1);
        assert_eq!(a.factory.offers_created() + b.factory.offers_created(), 1);
        assert_eq!(b.factory.answers_created(), 1);
        assert_eq!(a.factory.backends()[0].log().data_channels, vec![DATA_CHANNEL_LABEL]);
    }

    #[tokio::test]
    async fn test_early_candidates_are_buffered_then_flushed_in_order() {
        let bus = MemoryBus::new();
        let b = side(&bus, "bob", FakeNetwork::Silent, Arc::new(VirtualMicrophone::new())).await;
        let from = ParticipantId::from("alice");

        b.manager
            .handle_ice_candidate(IceCandidate::new("candidate:early-1"))
            .await
            .unwrap();
        b.manager
            .handle_ice_candidate(IceCandidate::new("candidate:early-2"))
            .await
            .unwrap();
        assert!(b.factory.backends().is_empty());

        b.manager
            .handle_sdp(&Signal {
                from: from.clone(),
                payload: SessionDescription::offer("v=0 remote"),
            })
            .await
            .unwrap();
        b.manager
            .handle_ice_candidate(IceCandidate::new("candidate:late"))
            .await
            .unwrap();

        let log = b.factory.backends()[0].log();
        assert_eq!(
            log.calls,
            vec![
                "remote:offer",
                "candidate:candidate:early-1",
                "candidate:candidate:early-2",
                "answer",
                "candidate:candidate:late",
            ]
        );
        assert_eq!(b.manager.state(), PeerState::Negotiating);
    }

    #[tokio::test]
    async fn test_glare_is_resolved_by_participant_id() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let b = side(&bus, "bob", FakeNetwork::Healthy, mic).await;
        assert!(!a.manager.is_polite_towards(&ParticipantId::from("bob")));
        assert!(b.manager.is_polite_towards(&ParticipantId::from("alice")));

        a.manager.start(true).await.unwrap();
        b.manager.start(true).await.unwrap();

        wait_until(|| a.manager.is_connected() && b.manager.is_connected()).await;

        // Bob yielded: his first connection was discarded and he answered.
        let bob_backends = b.factory.backends();
        assert_eq!(bob_backends.len(), 2);
        assert!(bob_backends[0].log().closed);
        assert_eq!(bob_backends[1].log().answers, 1);
        // Alice kept her single connection and took Bob's answer.
        let alice_backends = a.factory.backends();
        assert_eq!(alice_backends.len(), 1);
        assert!(alice_backends[0].log().calls.contains(&"remote:answer".to_string()));
        assert_eq!(a.factory.answers_created(), 0);
    }

    #[tokio::test]
    async fn test_kept_offer_is_reannounced_to_a_late_joiner() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        a.manager.start(true).await.unwrap();
        // Nobody else was subscribed, so that offer went nowhere.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let b = side(&bus, "bob", FakeNetwork::Healthy, mic).await;
        b.manager.start(true).await.unwrap();

        wait_until(|| a.manager.is_connected() && b.manager.is_connected()).await;
        assert_eq!(a.factory.offers_created(), 1);
        assert_eq!(a.factory.backends().len(), 1);
        assert_eq!(b.factory.answers_created(), 1);
        // Alice's candidate from before the join reaches Bob's answering connection.
        let answering = b.factory.backends()[1].clone();
        wait_until(|| {
            answering
                .log()
                .calls
                .contains(&"candidate:candidate:fake-0-1".to_string())
        })
        .await;
    }

    #[tokio::test]
    async fn test_repeated_offer_is_answered_once() {
        let bus = MemoryBus::new();
        let b = side(&bus, "bob", FakeNetwork::Silent, Arc::new(VirtualMicrophone::new())).await;
        let offer = Signal {
            from: ParticipantId::from("alice"),
            payload: SessionDescription::offer("v=0 remote"),
        };

        b.manager.handle_sdp(&offer).await.unwrap();
        b.manager.handle_sdp(&offer).await.unwrap();

        assert_eq!(b.factory.answers_created(), 1);
        assert_eq!(b.factory.backends().len(), 1);
    }

    #[tokio::test]
    async fn test_unsolicited_answer_is_ignored() {
        let bus = MemoryBus::new();
        let b = side(&bus, "bob", FakeNetwork::Healthy, Arc::new(VirtualMicrophone::new())).await;
        b.manager
            .handle_sdp(&Signal {
                from: ParticipantId::from("alice"),
                payload: SessionDescription::answer("v=0"),
            })
            .await
            .unwrap();
        assert_eq!(b.manager.state(), PeerState::New);
        assert!(b.factory.backends().is_empty());
    }

    #[tokio::test]
    async fn test_failure_and_drop_drive_state_and_disconnect_events() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let b = side(&bus, "bob", FakeNetwork::Healthy, mic).await;

        let disconnects = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = disconnects.clone();
        let _sub = a.manager.on_disconnect(move |state| seen.lock().push(state));

        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.is_connected()).await;

        a.factory.backends()[0].emit(BackendEvent::ConnectionState(
            BackendConnectionState::Disconnected,
        ));
        wait_until(|| a.manager.state() == PeerState::Disconnected).await;
        assert_eq!(*disconnects.lock(), vec![PeerState::Disconnected]);

        // Terminal: a late "connected" does not revive the connection.
        a.factory.backends()[0].emit(BackendEvent::ConnectionState(
            BackendConnectionState::Connected,
        ));
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(a.manager.state(), PeerState::Disconnected);
        drop(b);
    }

    #[tokio::test]
    async fn test_negotiation_failure_moves_to_failed_without_retry() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Failing, mic.clone()).await;
        let _b = side(&bus, "bob", FakeNetwork::Failing, mic).await;

        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.state() == PeerState::Failed).await;
        assert_eq!(a.factory.offers_created(), 1);
    }

    #[tokio::test]
    async fn test_messages_are_dropped_until_channel_opens() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;

        a.manager.send_message(&ApplicationMessage::text("too early")).await;

        let b = side(&bus, "bob", FakeNetwork::Healthy, mic).await;
        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.is_connected()).await;
        wait_until(|| a.factory.backends()[0].data_channel_open()).await;

        a.manager.send_message(&ApplicationMessage::text("hi")).await;
        assert_eq!(
            a.factory.backends()[0].log().sent,
            vec![r#"{"type":"text","text":"hi"}"#.to_string()]
        );
        drop(b);
    }

    #[tokio::test]
    async fn test_inbound_data_messages_are_decoded() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let _b = side(&bus, "bob", FakeNetwork::Healthy, mic).await;

        let received = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = received.clone();
        let _sub = a.manager.on_message(move |m| sink.lock().push(m.clone()));

        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.is_connected()).await;
        let backend = a.factory.backends()[0].clone();
        backend.emit(BackendEvent::DataMessage("not json".to_string()));
        backend.emit(BackendEvent::DataMessage(
            r#"{"type":"text","text":"hello"}"#.to_string(),
        ));

        wait_until(|| !received.lock().is_empty()).await;
        assert_eq!(*received.lock(), vec![ApplicationMessage::text("hello")]);
    }

    #[tokio::test]
    async fn test_audio_track_releases_device_on_stop() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let _b = side(&bus, "bob", FakeNetwork::Healthy, mic.clone()).await;

        assert!(a.manager.start_audio(None).await.is_err());

        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.is_connected()).await;

        a.manager.start_audio(None).await.unwrap();
        assert!(a.manager.has_audio().await);
        assert_eq!(a.factory.backends()[0].track_count(), 1);
        assert!(mic.is_held("virtual-default"));

        a.manager.stop_audio().await.unwrap();
        assert!(!a.manager.has_audio().await);
        assert_eq!(a.factory.backends()[0].track_count(), 0);
        assert!(!mic.is_held("virtual-default"));

        // The device can be reacquired immediately elsewhere.
        let again = mic.open(None).unwrap();
        drop(again);
        a.manager.stop_audio().await.unwrap();
    }

    #[tokio::test]
    async fn test_busy_device_rejects_start_audio_without_state_change() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let _b = side(&bus, "bob", FakeNetwork::Healthy, mic.clone()).await;
        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.is_connected()).await;

        let _elsewhere = mic.open(None).unwrap();
        let err = a.manager.start_audio(None).await.unwrap_err();
        assert!(matches!(err, RealtimeError::DeviceBusy(_)));
        assert_eq!(a.manager.state(), PeerState::Connected);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_releases_everything() {
        let bus = MemoryBus::new();
        let mic = Arc::new(VirtualMicrophone::new());
        let a = side(&bus, "alice", FakeNetwork::Healthy, mic.clone()).await;
        let _b = side(&bus, "bob", FakeNetwork::Healthy, mic.clone()).await;
        a.manager.start(true).await.unwrap();
        wait_until(|| a.manager.is_connected()).await;
        a.manager.start_audio(None).await.unwrap();

        a.manager.close().await;
        a.manager.close().await;

        assert_eq!(a.manager.state(), PeerState::Closed);
        assert!(a.factory.backends()[0].log().closed);
        assert!(!mic.is_held("virtual-default"));

        a.manager
            .handle_sdp(&Signal {
                from: ParticipantId::from("bob"),
                payload: SessionDescription::offer("v=0"),
            })
            .await
            .unwrap();
        assert_eq!(a.factory.backends().len(), 1);
        assert!(a.manager.start(true).await.is_err());
        a.channel.leave().await;
    }
}
