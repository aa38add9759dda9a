//! Test doubles shared by the component suites.

use crate::capture::CaptureStream;
use crate::peer::{
    BackendConnectionState, BackendEvent, PeerBackend, PeerBackendFactory, TrackId,
};
use crate::{RealtimeError, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use newme_realtime_types::{IceCandidate, SdpKind, SessionDescription};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

/// How fake connections behave once both descriptions are installed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FakeNetwork {
    /// Connects and opens the data channel.
    Healthy,
    /// Starts checking and never gets further.
    Silent,
    /// Starts checking and then fails.
    Failing,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct BackendLog {
    pub calls: Vec<String>,
    pub data_channels: Vec<String>,
    pub offers: u32,
    pub answers: u32,
    pub sent: Vec<String>,
    pub closed: bool,
}

#[derive(Default)]
struct BackendState {
    log: BackendLog,
    local_set: bool,
    remote_offer: bool,
    remote_set: bool,
    dc_open: bool,
    settled: bool,
    next_track: TrackId,
    tracks: HashMap<TrackId, CaptureStream>,
}

pub(crate) struct FakeBackend {
    id: usize,
    network: FakeNetwork,
    events: mpsc::UnboundedSender<BackendEvent>,
    state: Mutex<BackendState>,
}

impl FakeBackend {
    pub fn log(&self) -> BackendLog {
        self.state.lock().log.clone()
    }

    pub fn track_count(&self) -> usize {
        self.state.lock().tracks.len()
    }

    pub fn emit(&self, event: BackendEvent) {
        let _ = self.events.send(event);
    }

    fn local_candidate(&self, n: u32) {
        self.emit(BackendEvent::LocalCandidate(IceCandidate::new(format!(
            "candidate:fake-{}-{}",
            self.id, n
        ))));
    }

    fn maybe_settle(&self, state: &mut BackendState) {
        if state.settled || !(state.local_set && state.remote_set) {
            return;
        }
        state.settled = true;
        self.emit(BackendEvent::ConnectionState(BackendConnectionState::Connecting));
        match self.network {
            FakeNetwork::Healthy => {
                self.emit(BackendEvent::ConnectionState(BackendConnectionState::Connected));
                state.dc_open = true;
                self.emit(BackendEvent::DataChannelOpen);
            }
            FakeNetwork::Silent => {}
            FakeNetwork::Failing => {
                self.emit(BackendEvent::ConnectionState(BackendConnectionState::Failed));
            }
        }
    }
}

#[async_trait]
impl PeerBackend for FakeBackend {
    async fn create_data_channel(&self, label: &str) -> Result<()> {
        self.state.lock().log.data_channels.push(label.to_string());
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        state.log.offers += 1;
        state.log.calls.push("offer".to_string());
        state.local_set = true;
        let n = state.log.offers;
        self.local_candidate(n);
        self.maybe_settle(&mut state);
        Ok(SessionDescription::offer(format!("v=0 offer {}-{}", self.id, n)))
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let mut state = self.state.lock();
        if !state.remote_offer {
            return Err(RealtimeError::Negotiation("no remote offer".to_string()));
        }
        state.log.answers += 1;
        state.log.calls.push("answer".to_string());
        state.local_set = true;
        let n = state.log.answers;
        self.local_candidate(100 + n);
        self.maybe_settle(&mut state);
        Ok(SessionDescription::answer(format!("v=0 answer {}-{}", self.id, n)))
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        let mut state = self.state.lock();
        if state.log.closed {
            return Err(RealtimeError::Negotiation("connection closed".to_string()));
        }
        let kind = match description.kind {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
            SdpKind::Pranswer => "pranswer",
            SdpKind::Rollback => "rollback",
        };
        state.log.calls.push(format!("remote:{}", kind));
        state.remote_offer = description.is_offer();
        state.remote_set = true;
        self.maybe_settle(&mut state);
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut state = self.state.lock();
        if !state.remote_set {
            return Err(RealtimeError::Negotiation(
                "remote description not set".to_string(),
            ));
        }
        state.log.calls.push(format!("candidate:{}", candidate.candidate));
        Ok(())
    }

    async fn send_text(&self, text: String) -> Result<()> {
        let mut state = self.state.lock();
        if !state.dc_open {
            return Err(RealtimeError::Transport("data channel closed".to_string()));
        }
        state.log.sent.push(text);
        Ok(())
    }

    fn data_channel_open(&self) -> bool {
        self.state.lock().dc_open
    }

    async fn add_audio_track(&self, capture: CaptureStream) -> Result<TrackId> {
        let mut state = self.state.lock();
        state.next_track += 1;
        let id = state.next_track;
        state.tracks.insert(id, capture);
        Ok(id)
    }

    async fn remove_audio_track(&self, track: TrackId) -> Result<()> {
        self.state
            .lock()
            .tracks
            .remove(&track)
            .map(drop)
            .ok_or_else(|| RealtimeError::Negotiation(format!("unknown track {}", track)))
    }

    async fn close(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.log.closed = true;
        state.dc_open = false;
        state.tracks.clear();
        Ok(())
    }
}

#[derive(Clone)]
pub(crate) struct FakePeerFactory {
    network: FakeNetwork,
    backends: Arc<Mutex<Vec<Arc<FakeBackend>>>>,
}

impl FakePeerFactory {
    pub fn new(network: FakeNetwork) -> Self {
        Self {
            network,
            backends: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn backends(&self) -> Vec<Arc<FakeBackend>> {
        self.backends.lock().clone()
    }

    pub fn offers_created(&self) -> u32 {
        self.backends().iter().map(|b| b.log().offers).sum()
    }

    pub fn answers_created(&self) -> u32 {
        self.backends().iter().map(|b| b.log().answers).sum()
    }
}

#[async_trait]
impl PeerBackendFactory for FakePeerFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Arc<dyn PeerBackend>> {
        let mut backends = self.backends.lock();
        let backend = Arc::new(FakeBackend {
            id: backends.len(),
            network: self.network,
            events,
            state: Mutex::new(BackendState::default()),
        });
        backends.push(backend.clone());
        Ok(backend)
    }
}

/// Polls `condition` until it holds, panicking after two seconds.
pub(crate) async fn wait_until<F: Fn() -> bool>(condition: F) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        if tokio::time::Instant::now() > deadline {
            panic!("condition not reached within 2s");
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// One step of a scripted fallback relay.
#[derive(Debug, Clone)]
pub(crate) enum ServerStep {
    Send(String),
    /// Reads until at least one binary audio frame has arrived.
    AwaitAudio,
    Close,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct ServerRecord {
    pub authorization: Option<String>,
    pub texts: Vec<String>,
    pub binary_frames: usize,
    pub binary_bytes: usize,
    pub finished: bool,
}

/// Serves one fallback connection: records the handshake and every client
/// frame, and plays `script` after the first client text frame.
pub(crate) async fn spawn_transcript_server(
    script: Vec<ServerStep>,
) -> (String, Arc<Mutex<ServerRecord>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}/realtime", listener.local_addr().unwrap());
    let record = Arc::new(Mutex::new(ServerRecord::default()));
    let shared = record.clone();

    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut authorization = None;
        let ws = tokio_tungstenite::accept_hdr_async(
            stream,
            |request: &tokio_tungstenite::tungstenite::handshake::server::Request,
             response: tokio_tungstenite::tungstenite::handshake::server::Response| {
                authorization = request
                    .headers()
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Ok(response)
            },
        )
        .await
        .unwrap();
        shared.lock().authorization = authorization;
        let (mut tx, mut rx) = ws.split();

        let record_frame = |frame: &WsMessage| match frame {
            WsMessage::Text(text) => shared.lock().texts.push(text.to_string()),
            WsMessage::Binary(data) => {
                let mut record = shared.lock();
                record.binary_frames += 1;
                record.binary_bytes += data.len();
            }
            _ => {}
        };

        // The client announces its session first.
        while let Some(Ok(frame)) = rx.next().await {
            let is_text = matches!(frame, WsMessage::Text(_));
            record_frame(&frame);
            if is_text {
                break;
            }
        }

        for step in script {
            match step {
                ServerStep::Send(text) => {
                    if tx.send(WsMessage::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                ServerStep::AwaitAudio => {
                    while let Some(Ok(frame)) = rx.next().await {
                        let is_binary = matches!(frame, WsMessage::Binary(_));
                        record_frame(&frame);
                        if is_binary {
                            break;
                        }
                    }
                }
                ServerStep::Close => {
                    let _ = tx.send(WsMessage::Close(None)).await;
                    shared.lock().finished = true;
                    return;
                }
            }
        }

        while let Some(Ok(frame)) = rx.next().await {
            if matches!(frame, WsMessage::Close(_)) {
                break;
            }
            record_frame(&frame);
        }
        shared.lock().finished = true;
    });

    (url, record)
}
