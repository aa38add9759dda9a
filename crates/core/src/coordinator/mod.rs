//! One connect/disconnect/send/receive surface over whichever transport is live.
//!
//! Each `connect` spawns a session task that owns the signaling channel, the
//! peer attempt and, if promoted, the fallback transport. Transport callbacks
//! are forwarded into the task's queue so state changes are applied by one
//! consumer in arrival order.

mod state;

pub use state::SessionStateMachine;

use crate::capture::Microphone;
use crate::config::{Config, DEFAULT_NEGOTIATION_TIMEOUT, FallbackPolicy};
use crate::events::{EventEmitter, Subscription};
use crate::fallback::{FallbackTransport, STOPPED_BY_USER};
use crate::peer::{PeerBackendFactory, PeerConnectionManager, SignalingBinding};
use crate::signaling::{SignalingBus, SignalingChannel};
use crate::token::TokenIssuer;
use crate::{RealtimeError, Result};
use newme_realtime_types::{
    ApplicationMessage, AudioDevice, ConnectionState, ParticipantId, PeerState, SessionConfig,
    SessionId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

/// Collaborators injected into a coordinator.
#[derive(Clone)]
pub struct CoordinatorDeps {
    pub bus: Arc<dyn SignalingBus>,
    pub peers: Arc<dyn PeerBackendFactory>,
    pub microphone: Arc<dyn Microphone>,
    pub tokens: Arc<dyn TokenIssuer>,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub participant: ParticipantId,
    pub negotiation_timeout: Duration,
    pub fallback: FallbackPolicy,
    pub session: SessionConfig,
}

impl CoordinatorConfig {
    pub fn new(participant: ParticipantId) -> Self {
        Self {
            participant,
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            fallback: FallbackPolicy::default(),
            session: SessionConfig::default(),
        }
    }

    pub fn from_config(config: &Config, participant: ParticipantId) -> Self {
        Self {
            negotiation_timeout: config.negotiation_timeout,
            fallback: config.fallback_policy,
            ..Self::new(participant)
        }
    }

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }
}

/// Which transport currently carries the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    None,
    Peer,
    Fallback,
}

#[derive(Clone, Default)]
enum Current {
    #[default]
    None,
    Peer(Arc<PeerConnectionManager>),
    Fallback(Arc<FallbackTransport>),
}

impl Current {
    fn kind(&self) -> TransportKind {
        match self {
            Current::None => TransportKind::None,
            Current::Peer(_) => TransportKind::Peer,
            Current::Fallback(_) => TransportKind::Fallback,
        }
    }
}

#[derive(Default)]
struct CoordinatorEvents {
    message: EventEmitter<ApplicationMessage>,
    error: EventEmitter<RealtimeError>,
    audio_level: EventEmitter<f32>,
}

struct Runtime {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

pub struct SessionCoordinator {
    deps: CoordinatorDeps,
    participant: ParticipantId,
    negotiation_timeout: Duration,
    policy: FallbackPolicy,
    session_config: Arc<parking_lot::Mutex<SessionConfig>>,
    machine: Arc<SessionStateMachine>,
    events: Arc<CoordinatorEvents>,
    current: Arc<parking_lot::Mutex<Current>>,
    session_id: parking_lot::Mutex<Option<SessionId>>,
    runtime: tokio::sync::Mutex<Option<Runtime>>,
}

impl SessionCoordinator {
    pub fn new(deps: CoordinatorDeps, config: CoordinatorConfig) -> Self {
        Self {
            deps,
            participant: config.participant,
            negotiation_timeout: config.negotiation_timeout,
            policy: config.fallback,
            session_config: Arc::new(parking_lot::Mutex::new(config.session)),
            machine: Arc::new(SessionStateMachine::new()),
            events: Arc::new(CoordinatorEvents::default()),
            current: Arc::new(parking_lot::Mutex::new(Current::None)),
            session_id: parking_lot::Mutex::new(None),
            runtime: tokio::sync::Mutex::new(None),
        }
    }

    pub fn participant(&self) -> &ParticipantId {
        &self.participant
    }

    /// Starts a session as the offering side and returns once the attempt is
    /// under way; progress is observed through `on_state`.
    ///
    /// A finished session (failed or dropped) is replaced; a running one is
    /// an error until `disconnect` is called.
    #[instrument(skip(self), fields(participant = %self.participant))]
    pub async fn connect(&self, session_id: SessionId) -> Result<()> {
        let mut runtime = self.runtime.lock().await;
        if let Some(previous) = runtime.take() {
            if !self.machine.state().is_terminal() {
                let active = self
                    .session_id
                    .lock()
                    .clone()
                    .unwrap_or_else(|| session_id.clone());
                *runtime = Some(previous);
                return Err(RealtimeError::SessionActive(active));
            }
            // Finished sessions may still be releasing resources.
            let _ = previous.task.await;
        }
        if !self.machine.transition(ConnectionState::Connecting) {
            return Err(RealtimeError::SessionActive(session_id));
        }
        *self.session_id.lock() = Some(session_id.clone());

        let (stop_tx, stop_rx) = oneshot::channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let task = SessionTask {
            session_id: session_id.clone(),
            participant: self.participant.clone(),
            deps: self.deps.clone(),
            negotiation_timeout: self.negotiation_timeout,
            policy: self.policy,
            session_config: self.session_config.clone(),
            machine: self.machine.clone(),
            events: self.events.clone(),
            current: self.current.clone(),
            events_tx,
            signaling: None,
            peer: None,
            fallback: None,
        };
        let span = info_span!("session", session_id = %session_id, participant = %self.participant);
        *runtime = Some(Runtime {
            stop: stop_tx,
            task: tokio::spawn(task.run(stop_rx, events_rx).instrument(span)),
        });
        info!("Session connecting");
        Ok(())
    }

    /// Tears down whatever is live and settles in `Disconnected`. Idempotent.
    #[instrument(skip(self), fields(participant = %self.participant))]
    pub async fn disconnect(&self) {
        let runtime = self.runtime.lock().await.take();
        if let Some(runtime) = runtime {
            let _ = runtime.stop.send(());
            if let Err(e) = runtime.task.await {
                error!(error = %e, "Session task ended abnormally");
            }
        }
        *self.current.lock() = Current::None;
        *self.session_id.lock() = None;
        if self.machine.state() != ConnectionState::Disconnected {
            self.machine.transition(ConnectionState::Disconnected);
        }
    }

    /// Forwards to the live transport; dropped when none is live.
    pub async fn send_message(&self, message: &ApplicationMessage) {
        let current = self.current.lock().clone();
        match current {
            Current::Peer(manager) => manager.send_message(message).await,
            Current::Fallback(transport) => transport.send_message(message),
            Current::None => debug!("No active transport, dropping message"),
        }
    }

    /// Attaches the selected microphone to the peer connection. The fallback
    /// transport streams audio for its whole session, so this is a no-op there.
    pub async fn start_audio(&self) -> Result<()> {
        let current = self.current.lock().clone();
        match current {
            Current::Peer(manager) => {
                let device = self.session_config.lock().audio_device_id.clone();
                manager.start_audio(device.as_deref()).await
            }
            Current::Fallback(_) => Ok(()),
            Current::None => Err(RealtimeError::NoSession),
        }
    }

    pub async fn stop_audio(&self) -> Result<()> {
        let current = self.current.lock().clone();
        match current {
            Current::Peer(manager) => manager.stop_audio().await,
            Current::Fallback(_) => {
                debug!("Fallback audio stops with the session");
                Ok(())
            }
            Current::None => Ok(()),
        }
    }

    pub fn devices(&self) -> Result<Vec<AudioDevice>> {
        self.deps.microphone.devices()
    }

    /// Changes the capture device. A live fallback session is rebuilt; a
    /// live peer audio track is replaced.
    pub async fn select_device(&self, device_id: Option<String>) -> Result<()> {
        if let Some(id) = device_id.as_deref() {
            if !self.devices()?.iter().any(|d| d.id == id) {
                return Err(RealtimeError::DeviceAcquisition(format!(
                    "unknown device {}",
                    id
                )));
            }
        }
        let config = {
            let mut config = self.session_config.lock();
            config.audio_device_id = device_id;
            config.clone()
        };
        info!(device = ?config.audio_device_id, "Selected capture device");

        let current = self.current.lock().clone();
        match current {
            Current::Fallback(transport) => transport.update_session(&config).await,
            Current::Peer(manager) => {
                if !manager.has_audio().await {
                    return Ok(());
                }
                manager.start_audio(config.audio_device_id.as_deref()).await
            }
            Current::None => Ok(()),
        }
    }

    pub fn selected_device(&self) -> Option<String> {
        self.session_config.lock().audio_device_id.clone()
    }

    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn active_transport(&self) -> TransportKind {
        self.current.lock().kind()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id.lock().clone()
    }

    /// Inbound messages from either transport, in one shape.
    pub fn on_message<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&ApplicationMessage) + Send + Sync + 'static,
    {
        self.events.message.subscribe(observer)
    }

    pub fn on_state<F>(&self, observer: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.machine.on_change(observer)
    }

    pub fn on_error<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.events.error.subscribe(observer)
    }

    pub fn on_audio_level<F: Fn(f32) + Send + Sync + 'static>(&self, observer: F) -> Subscription {
        self.events.audio_level.subscribe(move |level| observer(*level))
    }
}

/// Transport callbacks, queued for the session task.
enum SessionEvent {
    PeerState(PeerState),
    PeerMessage(ApplicationMessage),
    Transcript { text: String, is_final: bool },
    AudioLevel(f32),
    FallbackError(RealtimeError),
    FallbackClosed(String),
}

#[derive(Debug, Clone, PartialEq)]
enum Flow {
    Continue,
    /// The peer attempt is over; promote or report.
    PeerFailed(RealtimeError),
    Finished,
    Stopped,
}

/// Runs `step` unless a stop request arrives first. `None` means stopped;
/// `stop` must not be polled again after that.
async fn until_stopped<F: Future>(stop: &mut oneshot::Receiver<()>, step: F) -> Option<F::Output> {
    tokio::select! {
        biased;
        _ = stop => None,
        output = step => Some(output),
    }
}

struct PeerAttempt {
    manager: Arc<PeerConnectionManager>,
    binding: SignalingBinding,
    subscriptions: Vec<Subscription>,
}

struct FallbackAttempt {
    transport: Arc<FallbackTransport>,
    subscriptions: Vec<Subscription>,
}

struct SessionTask {
    session_id: SessionId,
    participant: ParticipantId,
    deps: CoordinatorDeps,
    negotiation_timeout: Duration,
    policy: FallbackPolicy,
    session_config: Arc<parking_lot::Mutex<SessionConfig>>,
    machine: Arc<SessionStateMachine>,
    events: Arc<CoordinatorEvents>,
    current: Arc<parking_lot::Mutex<Current>>,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    signaling: Option<Arc<SignalingChannel>>,
    peer: Option<PeerAttempt>,
    fallback: Option<FallbackAttempt>,
}

impl SessionTask {
    async fn run(
        mut self,
        mut stop: oneshot::Receiver<()>,
        mut inbound: mpsc::UnboundedReceiver<SessionEvent>,
    ) {
        let deadline = tokio::time::sleep(self.negotiation_timeout);
        tokio::pin!(deadline);

        let mut flow = match until_stopped(&mut stop, self.start_peer()).await {
            Some(Ok(())) => Flow::Continue,
            Some(Err(e)) => Flow::PeerFailed(e),
            None => Flow::Stopped,
        };

        loop {
            flow = match flow {
                Flow::Continue => {
                    let negotiating =
                        self.peer.is_some() && self.machine.state() == ConnectionState::Connecting;
                    tokio::select! {
                        biased;
                        _ = &mut stop => Flow::Stopped,
                        _ = &mut deadline, if negotiating => {
                            Flow::PeerFailed(RealtimeError::NegotiationTimeout(self.negotiation_timeout))
                        }
                        Some(event) = inbound.recv() => self.handle(event),
                    }
                }
                Flow::PeerFailed(reason) => self.peer_failed(reason, &mut stop).await,
                Flow::Finished => break,
                Flow::Stopped => {
                    debug!("Stop requested");
                    break;
                }
            };
        }
        self.teardown().await;
    }

    async fn start_peer(&mut self) -> Result<()> {
        let signaling = Arc::new(SignalingChannel::new(
            self.deps.bus.clone(),
            self.participant.clone(),
        ));
        self.signaling = Some(signaling.clone());
        signaling.join(&self.session_id).await?;

        let manager = Arc::new(PeerConnectionManager::new(
            self.participant.clone(),
            signaling,
            self.deps.peers.clone(),
            self.deps.microphone.clone(),
        ));
        let binding = manager.bind_signaling();
        let tx = self.events_tx.clone();
        let state = manager.on_state(move |state| {
            let _ = tx.send(SessionEvent::PeerState(state));
        });
        let tx = self.events_tx.clone();
        let message = manager.on_message(move |message| {
            let _ = tx.send(SessionEvent::PeerMessage(message.clone()));
        });
        self.peer = Some(PeerAttempt {
            manager: manager.clone(),
            binding,
            subscriptions: vec![state, message],
        });
        *self.current.lock() = Current::Peer(manager.clone());

        manager.start(true).await
    }

    fn handle(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::PeerState(state) if self.peer.is_some() => self.on_peer_state(state),
            SessionEvent::PeerMessage(message) if self.peer.is_some() => {
                self.events.message.emit(&message);
                Flow::Continue
            }
            SessionEvent::Transcript { text, is_final } if self.fallback.is_some() => {
                self.events.message.emit(&normalize_transcript(text, is_final));
                Flow::Continue
            }
            SessionEvent::AudioLevel(level) if self.fallback.is_some() => {
                self.events.audio_level.emit(&level);
                Flow::Continue
            }
            SessionEvent::FallbackError(e) if self.fallback.is_some() => {
                self.events.error.emit(&e);
                if self.fallback_live() {
                    return Flow::Continue;
                }
                self.machine.transition(ConnectionState::Disconnected);
                Flow::Finished
            }
            SessionEvent::FallbackClosed(reason) if self.fallback.is_some() => {
                info!(%reason, "Fallback transport closed");
                self.machine.transition(ConnectionState::Disconnected);
                Flow::Finished
            }
            _ => {
                debug!("Ignoring event from an inactive transport");
                Flow::Continue
            }
        }
    }

    fn on_peer_state(&mut self, state: PeerState) -> Flow {
        match (state, self.machine.state()) {
            (PeerState::Connected, ConnectionState::Connecting) => {
                self.machine.transition(ConnectionState::Connected);
                Flow::Continue
            }
            (PeerState::Failed | PeerState::Disconnected, ConnectionState::Connecting) => {
                Flow::PeerFailed(RealtimeError::Negotiation(format!(
                    "peer connection {:?}",
                    state
                )))
            }
            (PeerState::Failed | PeerState::Disconnected, ConnectionState::Connected) => {
                info!(?state, "Peer connection dropped");
                self.machine.transition(ConnectionState::Disconnected);
                Flow::Finished
            }
            _ => Flow::Continue,
        }
    }

    /// The peer attempt did not connect: promote to the fallback transport or
    /// report, per policy. A stop request abandons the promotion silently.
    async fn peer_failed(&mut self, reason: RealtimeError, stop: &mut oneshot::Receiver<()>) -> Flow {
        warn!(error = %reason, "Peer attempt failed");
        self.teardown_peer().await;
        match self.policy {
            FallbackPolicy::Report => self.fail(reason),
            FallbackPolicy::Promote => {
                info!("Promoting session to the fallback transport");
                match until_stopped(stop, self.start_fallback()).await {
                    Some(Ok(())) => {
                        self.machine.transition(ConnectionState::Connected);
                        Flow::Continue
                    }
                    Some(Err(e)) => self.fail(e),
                    None => Flow::Stopped,
                }
            }
        }
    }

    fn fail(&mut self, reason: RealtimeError) -> Flow {
        error!(error = %reason, "Session failed");
        self.events.error.emit(&reason);
        self.machine.transition(ConnectionState::Failed);
        Flow::Finished
    }

    async fn start_fallback(&mut self) -> Result<()> {
        let transport = Arc::new(FallbackTransport::new(
            self.deps.microphone.clone(),
            self.deps.tokens.clone(),
        ));
        let tx = self.events_tx.clone();
        let partial = transport.on_partial_transcript(move |text| {
            let _ = tx.send(SessionEvent::Transcript {
                text: text.to_string(),
                is_final: false,
            });
        });
        let tx = self.events_tx.clone();
        let final_transcript = transport.on_final_transcript(move |text| {
            let _ = tx.send(SessionEvent::Transcript {
                text: text.to_string(),
                is_final: true,
            });
        });
        let tx = self.events_tx.clone();
        let level = transport.on_audio_level(move |level| {
            let _ = tx.send(SessionEvent::AudioLevel(level));
        });
        let tx = self.events_tx.clone();
        let failure = transport.on_error(move |e| {
            let _ = tx.send(SessionEvent::FallbackError(e.clone()));
        });
        let tx = self.events_tx.clone();
        let closed = transport.on_disconnected(move |reason| {
            // Stops requested by this coordinator are not transport drops.
            if reason != STOPPED_BY_USER {
                let _ = tx.send(SessionEvent::FallbackClosed(reason.to_string()));
            }
        });
        self.fallback = Some(FallbackAttempt {
            transport: transport.clone(),
            subscriptions: vec![partial, final_transcript, level, failure, closed],
        });
        *self.current.lock() = Current::Fallback(transport.clone());

        let config = self.session_config.lock().clone();
        if let Err(e) = transport.start_session(&config).await {
            self.teardown_fallback().await;
            return Err(e);
        }
        Ok(())
    }

    fn fallback_live(&self) -> bool {
        self.fallback
            .as_ref()
            .is_some_and(|f| f.transport.is_connected())
    }

    async fn teardown_peer(&mut self) {
        if let Some(peer) = self.peer.take() {
            *self.current.lock() = Current::None;
            peer.binding.detach();
            for subscription in peer.subscriptions {
                subscription.unsubscribe();
            }
            peer.manager.close().await;
        }
        if let Some(signaling) = self.signaling.take() {
            signaling.leave().await;
        }
    }

    async fn teardown_fallback(&mut self) {
        if let Some(fallback) = self.fallback.take() {
            *self.current.lock() = Current::None;
            for subscription in fallback.subscriptions {
                subscription.unsubscribe();
            }
            fallback.transport.stop_session().await;
        }
    }

    async fn teardown(&mut self) {
        self.teardown_peer().await;
        self.teardown_fallback().await;
        debug!("Session resources released");
    }
}

/// Fallback transcripts in the caller-facing message shape.
fn normalize_transcript(text: String, is_final: bool) -> ApplicationMessage {
    if is_final {
        ApplicationMessage::Text { text }
    } else {
        ApplicationMessage::Partial { text }
    }
}
