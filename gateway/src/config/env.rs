use std::path::PathBuf;
use std::str::FromStr;

use super::{
    ChatBackend, ConfigError, DEFAULT_CORS_ORIGINS, DEFAULT_OPENAI_MODEL, DEFAULT_REALTIME_URL,
    DEFAULT_REALTIME_VOICE, DEFAULT_TRUSTED_PROXIES, DEFAULT_TURNSTILE_VERIFY_URL, ServerConfig,
    TlsConfig, load_system_prompt,
};
use crate::utils::ip_network::parse_network_list;

const DEFAULT_TTS_SPEED: f32 = 0.95;

/// Read an environment variable, treating empty values as unset.
pub(super) fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_or(key: &str, default: &str) -> String {
    env_var(key).unwrap_or_else(|| default.to_string())
}

fn env_parse<T: FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env_var(key) {
        Some(value) => value
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidValue { key, value }),
        None => Ok(default),
    }
}

pub(super) fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}

/// TTS speed is forgiving: an unparsable value falls back to the default.
pub(super) fn parse_tts_speed(value: &str) -> f32 {
    match value.trim().parse::<f32>() {
        Ok(speed) if speed.is_finite() && speed > 0.0 => speed,
        _ => {
            tracing::warn!(
                value = %value,
                default = DEFAULT_TTS_SPEED,
                "Failed to parse TTS_SPEED, using default"
            );
            DEFAULT_TTS_SPEED
        }
    }
}

/// Build a configuration from environment variables, falling back to defaults.
pub(super) fn load_from_env() -> Result<ServerConfig, ConfigError> {
    let tls = match env_var("TLS_ENABLED").map(|v| parse_bool(&v)) {
        Some(true) => {
            let cert_path = env_var("TLS_CERT_PATH").ok_or_else(|| {
                ConfigError::Validation("TLS_CERT_PATH is required when TLS is enabled".into())
            })?;
            let key_path = env_var("TLS_KEY_PATH").ok_or_else(|| {
                ConfigError::Validation("TLS_KEY_PATH is required when TLS is enabled".into())
            })?;
            Some(TlsConfig {
                cert_path: PathBuf::from(cert_path),
                key_path: PathBuf::from(key_path),
            })
        }
        _ => None,
    };

    let backend = if env_var("USE_LOCAL_PIPELINE").is_some_and(|v| parse_bool(&v)) {
        ChatBackend::LocalPipeline
    } else {
        ChatBackend::Realtime
    };

    let system_prompt = load_system_prompt(env_var("SYSTEM_PROMPT_PATH").map(PathBuf::from));

    let tts_speed = env_var("TTS_SPEED")
        .map(|v| parse_tts_speed(&v))
        .unwrap_or(DEFAULT_TTS_SPEED);

    let trusted_proxies = parse_network_list(&env_or("TRUSTED_PROXIES", DEFAULT_TRUSTED_PROXIES))?;

    Ok(ServerConfig {
        host: env_or("HOST", "0.0.0.0"),
        port: env_parse("PORT", 8080)?,
        tls,

        backend,
        system_prompt,

        openai_api_key: env_var("OPENAI_API_KEY"),
        openai_model: env_or("OPENAI_MODEL", DEFAULT_OPENAI_MODEL),
        realtime_url: env_or("OPENAI_REALTIME_URL", DEFAULT_REALTIME_URL),
        realtime_voice: env_or("REALTIME_VOICE", DEFAULT_REALTIME_VOICE),

        local_llm_url: env_or("LOCAL_LLM_URL", "http://localhost:8000"),
        local_llm_model: env_or("LOCAL_LLM_MODEL", "qwen2.5-7b-instruct"),
        tts_url: env_or("TTS_URL", "http://localhost:8880"),
        tts_model: env_or("TTS_MODEL", "tts-1"),
        tts_voice: env_or("TTS_VOICE", "onyx"),
        tts_speed,
        upstream_timeout_seconds: env_parse("UPSTREAM_TIMEOUT_SECONDS", 120)?,

        jwt_secret: env_var("JWT_SECRET"),
        token_ttl_seconds: env_parse("TOKEN_TTL_SECONDS", 30 * 60)?,
        turnstile_secret: env_var("TURNSTILE_SECRET"),
        turnstile_site_key: env_or("TURNSTILE_SITE_KEY", ""),
        turnstile_verify_url: env_or("TURNSTILE_VERIFY_URL", DEFAULT_TURNSTILE_VERIFY_URL),

        cors_allowed_origins: Some(env_or("CORS_ALLOWED_ORIGINS", DEFAULT_CORS_ORIGINS)),
        trusted_proxies,
        rate_limit_requests_per_second: env_parse("RATE_LIMIT_REQUESTS_PER_SECOND", 10)?,
        rate_limit_burst_size: env_parse("RATE_LIMIT_BURST_SIZE", 20)?,
        max_connections_per_ip: env_parse("MAX_CONNECTIONS_PER_IP", 10)?,

        message_rate_period_seconds: env_parse("MESSAGE_RATE_PERIOD_SECONDS", 5)?,
        message_burst: env_parse("MESSAGE_BURST", 3)?,
        max_message_length: env_parse("MAX_MESSAGE_LENGTH", 4000)?,
        connection_timeout_seconds: env_parse("CONNECTION_TIMEOUT_SECONDS", 10 * 60)?,
        ping_interval_seconds: env_parse("PING_INTERVAL_SECONDS", 60)?,
        strict_single_flight: env_var("STRICT_SINGLE_FLIGHT").is_some_and(|v| parse_bool(&v)),
    })
}
