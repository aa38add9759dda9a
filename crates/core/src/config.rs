use std::time::Duration;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// What the coordinator does when a peer connection cannot be established.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum FallbackPolicy {
    /// Tear down the peer attempt and retry over the fallback transport.
    #[default]
    Promote,
    /// Report the failure to the caller and stop.
    Report,
}

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";
pub const DEFAULT_NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(15);

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub signaling_url: Option<String>,
    pub token_endpoint: Option<String>,
    pub token_api_key: Option<String>,
    pub ice_servers: Vec<String>,
    pub negotiation_timeout: Duration,
    pub fallback_policy: FallbackPolicy,
    pub log_level: Level,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_url: None,
            token_endpoint: None,
            token_api_key: None,
            ice_servers: vec![DEFAULT_STUN_SERVER.to_string()],
            negotiation_timeout: DEFAULT_NEGOTIATION_TIMEOUT,
            fallback_policy: FallbackPolicy::Promote,
            log_level: Level::INFO,
        }
    }
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let signaling_url = non_empty_var("SIGNALING_URL");
        let token_endpoint = non_empty_var("TOKEN_ENDPOINT");
        let token_api_key = non_empty_var("TOKEN_API_KEY");

        let ice_servers = match non_empty_var("ICE_SERVERS") {
            Some(raw) => raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            None => vec![DEFAULT_STUN_SERVER.to_string()],
        };
        if let Some(bad) = ice_servers
            .iter()
            .find(|url| !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")))
        {
            return Err(ConfigError::InvalidValue(
                "ICE_SERVERS".to_string(),
                format!("'{}' is not a stun:/turn: URL", bad),
            ));
        }

        let negotiation_timeout = match non_empty_var("NEGOTIATION_TIMEOUT_MS") {
            Some(raw) => {
                let millis = raw.parse::<u64>().map_err(|e| {
                    ConfigError::InvalidValue("NEGOTIATION_TIMEOUT_MS".to_string(), e.to_string())
                })?;
                if millis == 0 {
                    return Err(ConfigError::InvalidValue(
                        "NEGOTIATION_TIMEOUT_MS".to_string(),
                        "must be greater than zero".to_string(),
                    ));
                }
                Duration::from_millis(millis)
            }
            None => DEFAULT_NEGOTIATION_TIMEOUT,
        };

        let fallback_str =
            std::env::var("FALLBACK_POLICY").unwrap_or_else(|_| "promote".to_string());
        let fallback_policy = match fallback_str.to_lowercase().as_str() {
            "promote" => FallbackPolicy::Promote,
            "report" => FallbackPolicy::Report,
            other => {
                return Err(ConfigError::InvalidValue(
                    "FALLBACK_POLICY".to_string(),
                    format!("'{}' is not one of promote, report", other),
                ));
            }
        };

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        Ok(Self {
            signaling_url,
            token_endpoint,
            token_api_key,
            ice_servers,
            negotiation_timeout,
            fallback_policy,
            log_level,
        })
    }

    /// The signaling relay URL, required by anything that negotiates peers.
    pub fn require_signaling_url(&self) -> Result<&str, ConfigError> {
        self.signaling_url
            .as_deref()
            .ok_or_else(|| ConfigError::MissingVar("SIGNALING_URL".to_string()))
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}
