//! Application-level payloads exchanged once a transport is live.

use crate::session::SessionConfig;
use serde::{Deserialize, Serialize};

/// The uniform message shape delivered to callers, and the payload carried
/// over the peer data channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ApplicationMessage {
    /// A committed unit of text.
    Text { text: String },
    /// An in-progress transcript fragment, superseded by later ones.
    Partial { text: String },
}

impl ApplicationMessage {
    pub fn text(text: impl Into<String>) -> Self {
        ApplicationMessage::Text { text: text.into() }
    }

    pub fn partial(text: impl Into<String>) -> Self {
        ApplicationMessage::Partial { text: text.into() }
    }
}

/// Text frames received from the fallback relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FallbackServerMessage {
    Partial { transcript: String },
    Final { transcript: String },
    Error { message: String },
    #[serde(other)]
    Unknown,
}

/// Text frames sent to the fallback relay.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum FallbackClientMessage {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionSettings },
    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },
    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl FallbackClientMessage {
    /// The item that carries one line of user text into the conversation.
    pub fn user_text(text: impl Into<String>) -> Self {
        FallbackClientMessage::ConversationItemCreate {
            item: ConversationItem {
                kind: ItemKind::Message,
                role: ItemRole::User,
                content: vec![ContentPart::InputText { text: text.into() }],
            },
        }
    }
}

const DEFAULT_INSTRUCTIONS: &str = "You are a helpful assistant for voice chat.";

/// Session parameters announced to the relay right after the socket opens.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSettings {
    pub modalities: Vec<String>,
    pub instructions: String,
    pub voice: String,
    pub input_audio_format: String,
    pub output_audio_format: String,
    pub input_audio_transcription: AudioTranscription,
    pub turn_detection: TurnDetection,
    pub temperature: f32,
    pub max_response_output_tokens: u32,
}

impl SessionSettings {
    pub fn from_config(config: &SessionConfig) -> Self {
        let mut instructions = config
            .system_prompt
            .clone()
            .unwrap_or_else(|| DEFAULT_INSTRUCTIONS.to_string());
        if let Some(memory) = config.memory_context.as_deref().filter(|m| !m.is_empty()) {
            instructions.push_str("\n\n# Memory\n");
            instructions.push_str(memory);
        }
        Self {
            modalities: vec!["text".to_string()],
            instructions,
            voice: "alloy".to_string(),
            input_audio_format: "pcm16".to_string(),
            output_audio_format: "pcm16".to_string(),
            input_audio_transcription: AudioTranscription {
                model: "whisper-1".to_string(),
            },
            turn_detection: TurnDetection::default(),
            temperature: 0.8,
            max_response_output_tokens: 4096,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AudioTranscription {
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnDetection {
    #[serde(rename = "type")]
    pub kind: String,
    pub threshold: f32,
    pub prefix_padding_ms: u32,
    pub silence_duration_ms: u32,
}

impl Default for TurnDetection {
    fn default() -> Self {
        Self {
            kind: "server_vad".to_string(),
            threshold: 0.5,
            prefix_padding_ms: 300,
            silence_duration_ms: 500,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub kind: ItemKind,
    pub role: ItemRole,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    Message,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemRole {
    User,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    InputText { text: String },
}
