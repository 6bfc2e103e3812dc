use serde::Deserialize;
use std::path::PathBuf;

use super::env::parse_tts_speed;
use super::{ChatBackend, ConfigError, ServerConfig, TlsConfig, load_system_prompt};
use crate::utils::ip_network::parse_network_list;

/// Complete YAML configuration structure
///
/// All fields are optional to allow partial configuration. Values present in
/// the file override whatever the environment provided.
///
/// # Example YAML structure
/// ```yaml
/// server:
///   host: "0.0.0.0"
///   port: 8080
///   tls:
///     enabled: true
///     cert_path: "/etc/tls/cert.pem"
///     key_path: "/etc/tls/key.pem"
///
/// upstream:
///   backend: "local_pipeline"   # or "realtime"
///   system_prompt_path: "/app/data/system_prompt.txt"
///   openai_api_key: "sk-..."
///   openai_model: "gpt-realtime-mini"
///   realtime_voice: "cedar"
///   local_llm_url: "http://llm:8000"
///   local_llm_model: "qwen2.5-7b-instruct"
///   tts_url: "http://tts:8880"
///   tts_voice: "onyx"
///   tts_speed: 0.95
///
/// auth:
///   jwt_secret: "change-me"
///   token_ttl_seconds: 1800
///   turnstile_secret: "0x..."
///   turnstile_site_key: "0x..."
///
/// security:
///   cors_allowed_origins: "https://example.com"
///   trusted_proxies: ["10.42.0.0/16", "10.43.0.0/16"]
///   max_connections_per_ip: 10
///
/// session:
///   message_rate_period_seconds: 5
///   message_burst: 3
///   max_message_length: 4000
///   connection_timeout_seconds: 600
///   ping_interval_seconds: 60
///   strict_single_flight: false
/// ```
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct YamlConfig {
    pub server: Option<ServerYaml>,
    pub upstream: Option<UpstreamYaml>,
    pub auth: Option<AuthYaml>,
    pub security: Option<SecurityYaml>,
    pub session: Option<SessionYaml>,
}

/// Server configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ServerYaml {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub tls: Option<TlsYaml>,
}

/// TLS configuration from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct TlsYaml {
    pub enabled: Option<bool>,
    pub cert_path: Option<String>,
    pub key_path: Option<String>,
}

/// Upstream backend selection
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendYaml {
    Realtime,
    LocalPipeline,
}

/// Upstream settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct UpstreamYaml {
    pub backend: Option<BackendYaml>,
    pub system_prompt_path: Option<String>,
    pub openai_api_key: Option<String>,
    pub openai_model: Option<String>,
    pub realtime_url: Option<String>,
    pub realtime_voice: Option<String>,
    pub local_llm_url: Option<String>,
    pub local_llm_model: Option<String>,
    pub tts_url: Option<String>,
    pub tts_model: Option<String>,
    pub tts_voice: Option<String>,
    /// Accepts a number or a string; unparsable strings fall back to the default speed
    pub tts_speed: Option<serde_yaml::Value>,
    pub timeout_seconds: Option<u64>,
}

/// Token issuance settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AuthYaml {
    pub jwt_secret: Option<String>,
    pub token_ttl_seconds: Option<u64>,
    pub turnstile_secret: Option<String>,
    pub turnstile_site_key: Option<String>,
    pub turnstile_verify_url: Option<String>,
}

/// Security settings from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SecurityYaml {
    pub cors_allowed_origins: Option<String>,
    pub trusted_proxies: Option<Vec<String>>,
    pub rate_limit_requests_per_second: Option<u32>,
    pub rate_limit_burst_size: Option<u32>,
    pub max_connections_per_ip: Option<u32>,
}

/// Chat session tuning from YAML
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct SessionYaml {
    pub message_rate_period_seconds: Option<u64>,
    pub message_burst: Option<u32>,
    pub max_message_length: Option<usize>,
    pub connection_timeout_seconds: Option<u64>,
    pub ping_interval_seconds: Option<u64>,
    pub strict_single_flight: Option<bool>,
}

impl YamlConfig {
    /// Load configuration from a YAML file
    ///
    /// # Errors
    /// Returns an error if:
    /// - The file cannot be read
    /// - The YAML is malformed
    /// - Required fields have invalid types
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.clone(),
            source,
        })?;

        Ok(serde_yaml::from_str(&contents)?)
    }

    /// Overlay every value present in the file onto `config`.
    pub fn apply_to(self, config: &mut ServerConfig) -> Result<(), ConfigError> {
        if let Some(server) = self.server {
            if let Some(host) = server.host {
                config.host = host;
            }
            if let Some(port) = server.port {
                config.port = port;
            }
            if let Some(tls) = server.tls {
                config.tls = match tls.enabled {
                    Some(false) => None,
                    _ => match (tls.cert_path, tls.key_path) {
                        (Some(cert), Some(key)) => Some(TlsConfig {
                            cert_path: PathBuf::from(cert),
                            key_path: PathBuf::from(key),
                        }),
                        _ => {
                            return Err(ConfigError::Validation(
                                "server.tls requires cert_path and key_path".to_string(),
                            ));
                        }
                    },
                };
            }
        }

        if let Some(upstream) = self.upstream {
            if let Some(backend) = upstream.backend {
                config.backend = match backend {
                    BackendYaml::Realtime => ChatBackend::Realtime,
                    BackendYaml::LocalPipeline => ChatBackend::LocalPipeline,
                };
            }
            if let Some(path) = upstream.system_prompt_path {
                config.system_prompt = load_system_prompt(Some(PathBuf::from(path)));
            }
            if upstream.openai_api_key.is_some() {
                config.openai_api_key = upstream.openai_api_key;
            }
            set_if_some(&mut config.openai_model, upstream.openai_model);
            set_if_some(&mut config.realtime_url, upstream.realtime_url);
            set_if_some(&mut config.realtime_voice, upstream.realtime_voice);
            set_if_some(&mut config.local_llm_url, upstream.local_llm_url);
            set_if_some(&mut config.local_llm_model, upstream.local_llm_model);
            set_if_some(&mut config.tts_url, upstream.tts_url);
            set_if_some(&mut config.tts_model, upstream.tts_model);
            set_if_some(&mut config.tts_voice, upstream.tts_voice);
            if let Some(speed) = upstream.tts_speed {
                config.tts_speed = match speed {
                    serde_yaml::Value::Number(n) => parse_tts_speed(&n.to_string()),
                    serde_yaml::Value::String(s) => parse_tts_speed(&s),
                    other => parse_tts_speed(&format!("{other:?}")),
                };
            }
            set_if_some(&mut config.upstream_timeout_seconds, upstream.timeout_seconds);
        }

        if let Some(auth) = self.auth {
            if auth.jwt_secret.is_some() {
                config.jwt_secret = auth.jwt_secret.filter(|s| !s.is_empty());
            }
            if auth.turnstile_secret.is_some() {
                config.turnstile_secret = auth.turnstile_secret.filter(|s| !s.is_empty());
            }
            set_if_some(&mut config.token_ttl_seconds, auth.token_ttl_seconds);
            set_if_some(&mut config.turnstile_site_key, auth.turnstile_site_key);
            set_if_some(&mut config.turnstile_verify_url, auth.turnstile_verify_url);
        }

        if let Some(security) = self.security {
            if security.cors_allowed_origins.is_some() {
                config.cors_allowed_origins = security.cors_allowed_origins;
            }
            if let Some(proxies) = security.trusted_proxies {
                config.trusted_proxies = parse_network_list(&proxies.join(","))?;
            }
            set_if_some(
                &mut config.rate_limit_requests_per_second,
                security.rate_limit_requests_per_second,
            );
            set_if_some(
                &mut config.rate_limit_burst_size,
                security.rate_limit_burst_size,
            );
            set_if_some(
                &mut config.max_connections_per_ip,
                security.max_connections_per_ip,
            );
        }

        if let Some(session) = self.session {
            set_if_some(
                &mut config.message_rate_period_seconds,
                session.message_rate_period_seconds,
            );
            set_if_some(&mut config.message_burst, session.message_burst);
            set_if_some(&mut config.max_message_length, session.max_message_length);
            set_if_some(
                &mut config.connection_timeout_seconds,
                session.connection_timeout_seconds,
            );
            set_if_some(
                &mut config.ping_interval_seconds,
                session.ping_interval_seconds,
            );
            set_if_some(
                &mut config.strict_single_flight,
                session.strict_single_flight,
            );
        }

        Ok(())
    }
}

fn set_if_some<T>(target: &mut T, value: Option<T>) {
    if let Some(value) = value {
        *target = value;
    }
}
