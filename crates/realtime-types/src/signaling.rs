//! Messages relayed by the signaling channel during negotiation.

use crate::ids::ParticipantId;
use serde::{Deserialize, Serialize};

/// The role of a session description in the offer/answer exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// A session description, shaped like the browser's `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.kind == SdpKind::Offer
    }
}

/// A trickled connectivity candidate, shaped like `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }
}

/// A single negotiation message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum SignalingMessage {
    Sdp { description: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

/// A [`SignalingMessage`] stamped with its sender, as broadcast on the wire.
///
/// The JSON form is `{"from":..,"event":"sdp","payload":{"sdp":..}}` or
/// `{"from":..,"event":"ice_candidate","payload":{"candidate":..}}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "WireEnvelope", from = "WireEnvelope")]
pub struct SignalingEnvelope {
    pub from: ParticipantId,
    pub message: SignalingMessage,
}

impl SignalingEnvelope {
    pub fn new(from: ParticipantId, message: SignalingMessage) -> Self {
        Self { from, message }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    from: ParticipantId,
    #[serde(flatten)]
    frame: WireFrame,
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
enum WireFrame {
    Sdp { sdp: SessionDescription },
    IceCandidate { candidate: IceCandidate },
}

impl From<SignalingEnvelope> for WireEnvelope {
    fn from(envelope: SignalingEnvelope) -> Self {
        let frame = match envelope.message {
            SignalingMessage::Sdp { description } => WireFrame::Sdp { sdp: description },
            SignalingMessage::IceCandidate { candidate } => WireFrame::IceCandidate { candidate },
        };
        Self {
            from: envelope.from,
            frame,
        }
    }
}

impl From<WireEnvelope> for SignalingEnvelope {
    fn from(wire: WireEnvelope) -> Self {
        let message = match wire.frame {
            WireFrame::Sdp { sdp } => SignalingMessage::Sdp { description: sdp },
            WireFrame::IceCandidate { candidate } => SignalingMessage::IceCandidate { candidate },
        };
        Self {
            from: wire.from,
            message,
        }
    }
}
