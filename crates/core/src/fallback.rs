//! Server-relayed audio/text transport.
//!
//! Captured frames are downmixed to mono, encoded as 16-bit little-endian PCM
//! and sent as binary frames over one WebSocket; the relay answers with JSON
//! transcript frames.

use crate::audio::{LevelMeter, frame_to_pcm16};
use crate::capture::{CaptureStream, Microphone};
use crate::events::{EventEmitter, Subscription};
use crate::token::TokenIssuer;
use crate::{RealtimeError, Result};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use newme_realtime_types::{
    ApplicationMessage, FallbackClientMessage, FallbackServerMessage, SessionConfig,
    SessionSettings,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{Instrument, debug, error, info, info_span, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub const STOPPED_BY_USER: &str = "Session stopped by user";
pub const CONNECTION_CLOSED: &str = "WebSocket connection closed";
pub const CONNECTION_ERROR: &str = "WebSocket connection error";

#[derive(Default)]
struct FallbackEvents {
    connecting: EventEmitter<()>,
    connected: EventEmitter<()>,
    disconnected: EventEmitter<String>,
    partial: EventEmitter<String>,
    final_transcript: EventEmitter<String>,
    audio_level: EventEmitter<f32>,
    error: EventEmitter<RealtimeError>,
}

struct LiveSession {
    generation: u64,
    outbound: mpsc::UnboundedSender<FallbackClientMessage>,
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

type LiveSlot = Arc<parking_lot::Mutex<Option<LiveSession>>>;

pub struct FallbackTransport {
    microphone: Arc<dyn Microphone>,
    tokens: Arc<dyn TokenIssuer>,
    events: Arc<FallbackEvents>,
    live: LiveSlot,
    generation: AtomicU64,
    lifecycle: tokio::sync::Mutex<()>,
}

impl FallbackTransport {
    pub fn new(microphone: Arc<dyn Microphone>, tokens: Arc<dyn TokenIssuer>) -> Self {
        Self {
            microphone,
            tokens,
            events: Arc::new(FallbackEvents::default()),
            live: Arc::new(parking_lot::Mutex::new(None)),
            generation: AtomicU64::new(0),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Acquires the microphone, obtains a token, connects and starts
    /// streaming. A running session is stopped first.
    ///
    /// Failures are reported through `on_error` and returned; nothing stays
    /// acquired after a failed start.
    #[instrument(skip_all)]
    pub async fn start_session(&self, config: &SessionConfig) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_live().await;

        self.events.connecting.emit(&());
        let (capture, ws) = match self.open(config).await {
            Ok(opened) => opened,
            Err(e) => {
                error!(error = %e, "Failed to start fallback session");
                self.events.error.emit(&e);
                return Err(e);
            }
        };

        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (ws_tx, ws_rx) = ws.split();
        // Held until the slot is filled so the loop cannot race its own registration.
        let mut slot = self.live.lock();
        let task = tokio::spawn(
            run_session(SessionLoop {
                generation,
                ws_tx,
                ws_rx,
                capture,
                outbound: outbound_rx,
                stop: stop_rx,
                events: self.events.clone(),
                live: self.live.clone(),
            })
            .instrument(info_span!("fallback_session", generation)),
        );
        *slot = Some(LiveSession {
            generation,
            outbound: outbound_tx,
            stop: stop_tx,
            task,
        });
        drop(slot);

        info!(generation, "Fallback session connected");
        self.events.connected.emit(&());
        Ok(())
    }

    async fn open(&self, config: &SessionConfig) -> Result<(CaptureStream, WsStream)> {
        let capture = self.microphone.open(config.audio_device_id.as_deref())?;
        let grant = self.tokens.issue(config).await?;

        let mut request = grant
            .ws_url
            .as_str()
            .into_client_request()
            .map_err(|e| RealtimeError::Transport(e.to_string()))?;
        let bearer = format!("Bearer {}", grant.token)
            .parse()
            .map_err(|_| RealtimeError::Token("token is not a valid header value".to_string()))?;
        request.headers_mut().insert("Authorization", bearer);

        let (mut ws, _) = connect_async(request)
            .await
            .map_err(|e| RealtimeError::Transport(format!("connect {}: {}", grant.ws_url, e)))?;
        debug!(ws_url = %grant.ws_url, "Fallback socket open");

        let update = FallbackClientMessage::SessionUpdate {
            session: SessionSettings::from_config(config),
        };
        ws.send(WsMessage::Text(serde_json::to_string(&update)?.into()))
            .await?;
        Ok((capture, ws))
    }

    /// Stops capture and closes the connection. Idempotent.
    pub async fn stop_session(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_live().await;
    }

    /// Full teardown and rebuild with the new configuration.
    pub async fn update_session(&self, config: &SessionConfig) -> Result<()> {
        info!(device = ?config.audio_device_id, "Updating fallback session");
        self.stop_session().await;
        self.start_session(config).await
    }

    async fn stop_live(&self) {
        let live = self.live.lock().take();
        if let Some(live) = live {
            let _ = live.stop.send(());
            let _ = live.task.await;
            info!(generation = live.generation, "Fallback session stopped");
            self.events.disconnected.emit(&STOPPED_BY_USER.to_string());
        }
    }

    /// Sends user text; a no-op while no session is live.
    pub fn send_message(&self, message: &ApplicationMessage) {
        let live = self.live.lock();
        let Some(live) = live.as_ref() else {
            debug!("No fallback session, dropping message");
            return;
        };
        match message {
            ApplicationMessage::Text { text } => {
                let _ = live.outbound.send(FallbackClientMessage::user_text(text.clone()));
                let _ = live.outbound.send(FallbackClientMessage::ResponseCreate);
            }
            ApplicationMessage::Partial { .. } => debug!("Partial messages are not sent upstream"),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.live.lock().is_some()
    }

    pub fn on_connecting<F: Fn() + Send + Sync + 'static>(&self, observer: F) -> Subscription {
        self.events.connecting.subscribe(move |_| observer())
    }

    pub fn on_connected<F: Fn() + Send + Sync + 'static>(&self, observer: F) -> Subscription {
        self.events.connected.subscribe(move |_| observer())
    }

    pub fn on_disconnected<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.disconnected.subscribe(move |reason| observer(reason))
    }

    pub fn on_partial_transcript<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.partial.subscribe(move |t| observer(t))
    }

    pub fn on_final_transcript<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.events.final_transcript.subscribe(move |t| observer(t))
    }

    pub fn on_audio_level<F: Fn(f32) + Send + Sync + 'static>(&self, observer: F) -> Subscription {
        self.events.audio_level.subscribe(move |level| observer(*level))
    }

    pub fn on_error<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&RealtimeError) + Send + Sync + 'static,
    {
        self.events.error.subscribe(observer)
    }
}

struct SessionLoop {
    generation: u64,
    ws_tx: SplitSink<WsStream, WsMessage>,
    ws_rx: SplitStream<WsStream>,
    capture: CaptureStream,
    outbound: mpsc::UnboundedReceiver<FallbackClientMessage>,
    stop: oneshot::Receiver<()>,
    events: Arc<FallbackEvents>,
    live: LiveSlot,
}

enum Exit {
    Stopped,
    Closed,
    Failed(RealtimeError),
}

async fn run_session(session: SessionLoop) {
    let SessionLoop {
        generation,
        mut ws_tx,
        mut ws_rx,
        mut capture,
        mut outbound,
        mut stop,
        events,
        live,
    } = session;
    let mut meter = LevelMeter::new();

    let exit = loop {
        tokio::select! {
            biased;
            _ = &mut stop => break Exit::Stopped,
            Some(message) = outbound.recv() => {
                let text = match serde_json::to_string(&message) {
                    Ok(text) => text,
                    Err(e) => break Exit::Failed(e.into()),
                };
                if let Err(e) = ws_tx.send(WsMessage::Text(text.into())).await {
                    break Exit::Failed(e.into());
                }
            }
            inbound = ws_rx.next() => match inbound {
                Some(Ok(WsMessage::Text(text))) => {
                    match serde_json::from_str::<FallbackServerMessage>(&text) {
                        Ok(FallbackServerMessage::Partial { transcript }) => events.partial.emit(&transcript),
                        Ok(FallbackServerMessage::Final { transcript }) => events.final_transcript.emit(&transcript),
                        Ok(FallbackServerMessage::Error { message }) => break Exit::Failed(RealtimeError::Transport(message)),
                        Ok(FallbackServerMessage::Unknown) => debug!("Ignoring unrecognised relay frame"),
                        Err(e) => warn!(error = %e, "Dropping undecodable relay frame"),
                    }
                }
                Some(Ok(WsMessage::Close(_))) | None => break Exit::Closed,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(error = %e, "Fallback socket failed");
                    break Exit::Failed(RealtimeError::Transport(CONNECTION_ERROR.to_string()));
                }
            },
            frame = capture.next_frame() => match frame {
                Some(frame) => {
                    let level = meter.update(&frame);
                    events.audio_level.emit(&level);
                    let pcm = frame_to_pcm16(&frame);
                    if let Err(e) = ws_tx.send(WsMessage::Binary(pcm.to_vec().into())).await {
                        break Exit::Failed(e.into());
                    }
                }
                None => break Exit::Failed(RealtimeError::DeviceAcquisition(
                    "capture device stopped".to_string(),
                )),
            },
        }
    };

    // Release everything before anyone hears about it.
    let _ = ws_tx.send(WsMessage::Close(None)).await;
    let _ = ws_tx.close().await;
    drop(capture);

    if matches!(exit, Exit::Stopped) {
        return;
    }
    // Only report if this loop still owns the slot; a concurrent stop reports itself.
    let owned = {
        let mut slot = live.lock();
        if slot.as_ref().is_some_and(|s| s.generation == generation) {
            slot.take();
            true
        } else {
            false
        }
    };
    if !owned {
        return;
    }
    match exit {
        Exit::Closed => {
            info!("Fallback socket closed by relay");
            events.disconnected.emit(&CONNECTION_CLOSED.to_string());
        }
        Exit::Failed(e) => {
            error!(error = %e, "Fallback session failed");
            events.error.emit(&e);
            events.disconnected.emit(&CONNECTION_ERROR.to_string());
        }
        Exit::Stopped => {}
    }
}
