//! Shared application state
//!
//! One [`AppState`] is built at startup and handed to every router behind an
//! `Arc`. It owns the token issuer, the connection registry and the selected
//! upstream backend. Nothing in here is per-connection.

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::auth::{TokenIssuer, TurnstileVerifier};
use crate::config::{ChatBackend, ServerConfig};
use crate::core::registry::ConnectionRegistry;
use crate::core::upstream::{
    LocalPipeline, OpenAIRealtimeConnector, RealtimeConnector, UpstreamError, UpstreamResult,
};
use crate::middleware::origin::OriginPolicy;

/// Idle pooled connections are dropped after this long
const HTTP_POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// The AI backend chat sessions talk to
#[derive(Clone)]
pub enum UpstreamBackend {
    /// One persistent realtime WebSocket per session
    Realtime(Arc<dyn RealtimeConnector>),
    /// Chat completion + TTS over HTTP, per exchange
    Local(Arc<LocalPipeline>),
}

impl UpstreamBackend {
    pub fn name(&self) -> &'static str {
        match self {
            UpstreamBackend::Realtime(_) => "realtime",
            UpstreamBackend::Local(_) => "local_pipeline",
        }
    }
}

impl std::fmt::Debug for UpstreamBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Application state shared across all routes
pub struct AppState {
    pub config: ServerConfig,
    pub token_issuer: TokenIssuer,
    pub registry: Arc<ConnectionRegistry>,
    pub upstream: UpstreamBackend,
    pub origins: OriginPolicy,
}

impl AppState {
    /// Build state for `config`, constructing the configured upstream.
    pub fn new(config: ServerConfig) -> UpstreamResult<Arc<Self>> {
        let http_client = build_http_client()?;

        let upstream = match config.backend {
            ChatBackend::Realtime => {
                let api_key = config.openai_api_key.clone().unwrap_or_default();
                let connector = OpenAIRealtimeConnector::new(
                    api_key,
                    &config.realtime_url,
                    &config.openai_model,
                    config.realtime_voice.clone(),
                )?;
                info!(model = %config.openai_model, voice = %config.realtime_voice, "Using OpenAI realtime upstream");
                UpstreamBackend::Realtime(Arc::new(connector))
            }
            ChatBackend::LocalPipeline => {
                UpstreamBackend::Local(Arc::new(LocalPipeline::new(&config, http_client.clone())))
            }
        };

        Ok(Self::with_upstream(config, upstream, http_client))
    }

    /// Build state around an already constructed upstream.
    pub fn with_upstream(
        config: ServerConfig,
        upstream: UpstreamBackend,
        http_client: reqwest::Client,
    ) -> Arc<Self> {
        let turnstile = TurnstileVerifier::new(
            http_client,
            config.turnstile_secret.clone(),
            config.turnstile_verify_url.clone(),
        );
        let token_issuer = TokenIssuer::new(
            config.jwt_secret.clone(),
            Duration::from_secs(config.token_ttl_seconds),
            turnstile.is_enabled().then_some(turnstile),
        );
        let registry = ConnectionRegistry::new(config.max_connections_per_ip);
        let origins = OriginPolicy::from_config(config.cors_allowed_origins.as_deref());

        Arc::new(Self {
            config,
            token_issuer,
            registry,
            upstream,
            origins,
        })
    }
}

/// Shared HTTP client for Turnstile and the local pipeline.
pub fn build_http_client() -> UpstreamResult<reqwest::Client> {
    reqwest::Client::builder()
        .pool_idle_timeout(HTTP_POOL_IDLE_TIMEOUT)
        .tcp_nodelay(true)
        .build()
        .map_err(|e| UpstreamError::Unavailable(format!("failed to build HTTP client: {e}")))
}
