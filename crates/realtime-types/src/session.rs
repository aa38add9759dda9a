use serde::{Deserialize, Serialize};

/// Per-session options supplied by the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Capture device to use; `None` selects the system default.
    pub audio_device_id: Option<String>,
    pub system_prompt: Option<String>,
    pub memory_context: Option<String>,
}

impl SessionConfig {
    pub fn with_device(mut self, device_id: Option<String>) -> Self {
        self.audio_device_id = device_id;
        self
    }
}

/// A short-lived credential and endpoint for the fallback transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenGrant {
    pub token: String,
    #[serde(rename = "wsUrl")]
    pub ws_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_grant_uses_camel_case_url() {
        let grant: TokenGrant =
            serde_json::from_str(r#"{"token":"t-1","wsUrl":"wss://relay.example/ws"}"#).unwrap();
        assert_eq!(grant.token, "t-1");
        assert_eq!(grant.ws_url, "wss://relay.example/ws");
    }

    #[test]
    fn test_session_config_camel_case() {
        let config = SessionConfig::default().with_device(Some("mic-2".into()));
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["audioDeviceId"], "mic-2");
    }
}
