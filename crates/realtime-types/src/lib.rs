//! Wire and data types shared by the realtime voice/chat layer.
//!
//! Every payload that crosses the signaling channel, the peer data channel or
//! the fallback socket is a closed, serde-tagged type defined here, so the
//! components that consume them can match exhaustively.

pub mod audio;
pub mod ids;
pub mod message;
pub mod session;
pub mod signaling;
pub mod state;

pub use audio::{AudioDevice, AudioFrame, FRAME_SIZE};
pub use ids::{ParticipantId, SessionId};
pub use message::{
    ApplicationMessage, ContentPart, ConversationItem, FallbackClientMessage,
    FallbackServerMessage, SessionSettings, TurnDetection,
};
pub use session::{SessionConfig, TokenGrant};
pub use signaling::{IceCandidate, SdpKind, SessionDescription, SignalingEnvelope, SignalingMessage};
pub use state::{ConnectionState, PeerState};
