use crate::{RealtimeError, Result};
use async_trait::async_trait;
use newme_realtime_types::{SessionConfig, TokenGrant};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, instrument};

/// Upper bound on one token request, connect included.
pub const DEFAULT_TOKEN_TIMEOUT: Duration = Duration::from_secs(10);

/// Issues short-lived credentials for the fallback transport.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TokenIssuer: Send + Sync {
    async fn issue(&self, config: &SessionConfig) -> Result<TokenGrant>;
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    system_prompt: Option<&'a str>,
    memory_context: Option<&'a str>,
}

/// Calls an HTTP function that answers `{token, wsUrl}`.
pub struct HttpTokenIssuer {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpTokenIssuer {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>) -> Result<Self> {
        Self::with_timeout(endpoint, api_key, DEFAULT_TOKEN_TIMEOUT)
    }

    pub fn with_timeout(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RealtimeError::Token(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
        })
    }
}

#[async_trait]
impl TokenIssuer for HttpTokenIssuer {
    #[instrument(skip_all, fields(endpoint = %self.endpoint))]
    async fn issue(&self, config: &SessionConfig) -> Result<TokenGrant> {
        let body = TokenRequest {
            system_prompt: config.system_prompt.as_deref(),
            memory_context: config.memory_context.as_deref(),
        };
        let mut request = self.client.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let grant = request
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(|e| RealtimeError::Token(e.to_string()))?
            .json::<TokenGrant>()
            .await
            .map_err(|e| RealtimeError::Token(e.to_string()))?;

        if grant.token.is_empty() || grant.ws_url.is_empty() {
            return Err(RealtimeError::Token(
                "token endpoint returned an empty grant".to_string(),
            ));
        }
        debug!(ws_url = %grant.ws_url, "Issued fallback token");
        Ok(grant)
    }
}

/// Hands out a fixed grant; for local relays that need no credential.
pub struct StaticTokenIssuer {
    grant: TokenGrant,
}

impl StaticTokenIssuer {
    pub fn new(grant: TokenGrant) -> Self {
        Self { grant }
    }
}

#[async_trait]
impl TokenIssuer for StaticTokenIssuer {
    async fn issue(&self, _config: &SessionConfig) -> Result<TokenGrant> {
        Ok(self.grant.clone())
    }
}

/// Used when no token endpoint is configured.
pub struct UnavailableTokenIssuer;

#[async_trait]
impl TokenIssuer for UnavailableTokenIssuer {
    async fn issue(&self, _config: &SessionConfig) -> Result<TokenGrant> {
        Err(RealtimeError::Token(
            "no token endpoint configured".to_string(),
        ))
    }
}
