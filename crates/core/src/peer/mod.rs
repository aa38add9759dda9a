//! One peer-to-peer connection per session.
//!
//! [`PeerBackend`] is the seam to the underlying peer-connection stack;
//! [`PeerConnectionManager`] drives negotiation over a signaling channel and
//! owns the connection state machine.

mod manager;
#[cfg(feature = "webrtc")]
mod webrtc;

pub use manager::{PeerConnectionManager, SignalingBinding};
#[cfg(feature = "webrtc")]
pub use self::webrtc::WebRtcFactory;

use crate::Result;
use crate::capture::CaptureStream;
use async_trait::async_trait;
use newme_realtime_types::{IceCandidate, SessionDescription};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Label of the data channel created by the offering side.
pub const DATA_CHANNEL_LABEL: &str = "chat";

/// Handle of an audio track attached to a backend.
pub type TrackId = u64;

/// Connection state as reported by the underlying stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks of the underlying stack, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    LocalCandidate(IceCandidate),
    ConnectionState(BackendConnectionState),
    DataChannelOpen,
    DataChannelClosed,
    DataMessage(String),
}

#[async_trait]
pub trait PeerBackend: Send + Sync {
    async fn create_data_channel(&self, label: &str) -> Result<()>;

    /// Creates an offer and installs it as the local description.
    async fn create_offer(&self) -> Result<SessionDescription>;

    /// Creates an answer to the installed remote offer and installs it locally.
    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn send_text(&self, text: String) -> Result<()>;

    fn data_channel_open(&self) -> bool;

    /// Starts sending a capture as an outbound audio track. The backend owns
    /// the stream until the track is removed or the connection closes.
    async fn add_audio_track(&self, capture: CaptureStream) -> Result<TrackId>;

    async fn remove_audio_track(&self, track: TrackId) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait PeerBackendFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Arc<dyn PeerBackend>>;
}
