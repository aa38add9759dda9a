use newme_realtime_types::SessionId;
use std::time::Duration;

/// Errors produced by the realtime layer.
///
/// Variants carry rendered messages rather than source errors so a single
/// failure can be handed to every `on_error` observer.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RealtimeError {
    #[error("Peer negotiation failed: {0}")]
    Negotiation(String),
    #[error("Peer negotiation did not complete within {0:?}")]
    NegotiationTimeout(Duration),
    #[error("Capture device unavailable: {0}")]
    DeviceAcquisition(String),
    #[error("Capture device busy: {0}")]
    DeviceBusy(String),
    #[error("Failed to obtain access token: {0}")]
    Token(String),
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Signaling error: {0}")]
    Signaling(String),
    #[error("Invalid payload: {0}")]
    Payload(String),
    #[error("Session {0} is already active")]
    SessionActive(SessionId),
    #[error("No active session")]
    NoSession,
}

pub type Result<T, E = RealtimeError> = std::result::Result<T, E>;

impl From<serde_json::Error> for RealtimeError {
    fn from(err: serde_json::Error) -> Self {
        RealtimeError::Payload(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RealtimeError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        RealtimeError::Transport(err.to_string())
    }
}
