//! Gateway configuration
//!
//! A [`ServerConfig`] is assembled from environment variables (with `.env`
//! already applied by `main`) and, when `-c` is given, a YAML file whose
//! values win over the environment. Whichever source is used, the result is
//! validated once before the server starts.
//!
//! Submodules: `env` reads variables and defaults, `yaml` applies file
//! overrides, `prompt` resolves the persona prompt from disk.
//!
//! ```rust,no_run
//! use avatar_gateway::config::{ChatBackend, ServerConfig};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ServerConfig::from_file(&PathBuf::from("gateway.yaml"))?;
//! if config.backend == ChatBackend::LocalPipeline {
//!     println!("chat via {} and {}", config.local_llm_url, config.tts_url);
//! }
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::utils::ip_network::{IpNetwork, IpNetworkError};

mod env;
mod prompt;
mod yaml;

pub use prompt::{FALLBACK_SYSTEM_PROMPT, load_system_prompt};

/// Default OpenAI realtime model
pub const DEFAULT_OPENAI_MODEL: &str = "gpt-realtime-mini";
/// Default OpenAI realtime WebSocket endpoint (model is appended as a query parameter)
pub const DEFAULT_REALTIME_URL: &str = "wss://api.openai.com/v1/realtime";
/// Default voice used by the realtime backend
pub const DEFAULT_REALTIME_VOICE: &str = "cedar";
/// Default Cloudflare Turnstile verification endpoint
pub const DEFAULT_TURNSTILE_VERIFY_URL: &str =
    "https://challenges.cloudflare.com/turnstile/v0/siteverify";
/// Default CORS origins for the chat frontend
pub const DEFAULT_CORS_ORIGINS: &str =
    "http://localhost:5173,http://localhost:3000,https://christianmoore.me";
/// Default trusted reverse proxy ranges (cluster pod and service networks)
pub const DEFAULT_TRUSTED_PROXIES: &str = "10.42.0.0/16,10.43.0.0/16";

/// Errors raised while loading or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid value for {key}: '{value}'")]
    InvalidValue { key: &'static str, value: String },

    #[error("Invalid network list: {0}")]
    InvalidNetwork(#[from] IpNetworkError),

    #[error("{0}")]
    Validation(String),
}

/// TLS configuration for HTTPS and WSS
#[derive(Debug, Clone)]
pub struct TlsConfig {
    /// Path to the TLS certificate file (PEM format)
    pub cert_path: PathBuf,
    /// Path to the TLS private key file (PEM format)
    pub key_path: PathBuf,
}

/// Which upstream answers chat messages. Exactly one is active per deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChatBackend {
    /// OpenAI realtime WebSocket protocol
    #[default]
    Realtime,
    /// OpenAI-compatible chat completion + text-to-speech HTTP endpoints
    LocalPipeline,
}

/// Server configuration
///
/// Contains all configuration needed to run the gateway, including:
/// - Server settings (host, port, TLS)
/// - Upstream selection and credentials (realtime or local pipeline)
/// - Token issuance and Turnstile verification
/// - Security settings (CORS, trusted proxies, rate limiting, connection limits)
/// - Chat session tuning (message limits, keepalive, lifetime)
#[derive(Debug, Clone)]
pub struct ServerConfig {
    // Server settings
    pub host: String,
    pub port: u16,

    // TLS configuration (optional)
    pub tls: Option<TlsConfig>,

    // Upstream selection
    pub backend: ChatBackend,
    /// Persona instructions sent to whichever upstream is active
    pub system_prompt: String,

    // Realtime upstream
    pub openai_api_key: Option<String>,
    pub openai_model: String,
    pub realtime_url: String,
    pub realtime_voice: String,

    // Local pipeline upstream
    pub local_llm_url: String,
    pub local_llm_model: String,
    pub tts_url: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub tts_speed: f32,
    /// Timeout applied to each local pipeline HTTP call
    pub upstream_timeout_seconds: u64,

    // Token issuance
    /// HS256 signing secret. `None` enables open mode (no credential checks).
    pub jwt_secret: Option<String>,
    pub token_ttl_seconds: u64,
    /// Turnstile secret. `None` treats every challenge as verified.
    pub turnstile_secret: Option<String>,
    pub turnstile_site_key: String,
    pub turnstile_verify_url: String,

    // Security settings
    /// Comma separated origins, or `*`
    pub cors_allowed_origins: Option<String>,
    pub trusted_proxies: Vec<IpNetwork>,
    pub rate_limit_requests_per_second: u32,
    pub rate_limit_burst_size: u32,
    pub max_connections_per_ip: u32,

    // Chat session settings
    pub message_rate_period_seconds: u64,
    pub message_burst: u32,
    pub max_message_length: usize,
    pub connection_timeout_seconds: u64,
    pub ping_interval_seconds: u64,
    /// Reject a new message while a reply is still streaming
    pub strict_single_flight: bool,
}

/// Secrets are wiped when the config goes away
impl Drop for ServerConfig {
    fn drop(&mut self) {
        use zeroize::Zeroize;

        if let Some(ref mut key) = self.openai_api_key {
            key.zeroize();
        }
        if let Some(ref mut secret) = self.jwt_secret {
            secret.zeroize();
        }
        if let Some(ref mut secret) = self.turnstile_secret {
            secret.zeroize();
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables (with defaults).
    ///
    /// The `.env` file is loaded in `main` before this is called.
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = env::load_from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load the environment, then apply every key present in the YAML file.
    ///
    /// Fails when the file is unreadable or malformed, when an environment
    /// value does not parse, or when the merged result does not validate.
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let yaml_config = yaml::YamlConfig::from_file(path)?;
        let mut config = env::load_from_env()?;
        yaml_config.apply_to(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    /// Get the server address as a string in the format "host:port"
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check if TLS is enabled
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// True when no JWT secret is configured and every credential is accepted.
    pub fn is_open_auth(&self) -> bool {
        self.jwt_secret.is_none()
    }

    pub fn message_rate_period(&self) -> Duration {
        Duration::from_secs(self.message_rate_period_seconds)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_timeout_seconds)
    }

    pub fn ping_interval(&self) -> Duration {
        Duration::from_secs(self.ping_interval_seconds)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.backend == ChatBackend::Realtime
            && self.openai_api_key.as_deref().is_none_or(str::is_empty)
        {
            return Err(ConfigError::Validation(
                "OPENAI_API_KEY is required unless USE_LOCAL_PIPELINE=true".to_string(),
            ));
        }
        if self.message_burst == 0 {
            return Err(ConfigError::Validation(
                "MESSAGE_BURST must be at least 1".to_string(),
            ));
        }
        if self.message_rate_period_seconds == 0 {
            return Err(ConfigError::Validation(
                "MESSAGE_RATE_PERIOD_SECONDS must be at least 1".to_string(),
            ));
        }
        if self.max_connections_per_ip == 0 {
            return Err(ConfigError::Validation(
                "MAX_CONNECTIONS_PER_IP must be at least 1".to_string(),
            ));
        }
        if self.max_message_length == 0 {
            return Err(ConfigError::Validation(
                "MAX_MESSAGE_LENGTH must be at least 1".to_string(),
            ));
        }
        if self.ping_interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "PING_INTERVAL_SECONDS must be at least 1".to_string(),
            ));
        }
        if self.is_open_auth() {
            tracing::warn!(
                "JWT_SECRET is not set: running in open auth mode, every credential is accepted. \
                 Never deploy this configuration."
            );
        }
        Ok(())
    }
}
