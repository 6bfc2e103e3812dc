//! Cloudflare Turnstile challenge verification
//!
//! A single POST to the siteverify endpoint. Any transport or decode failure
//! fails closed; there are no retries.

use std::net::IpAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::errors::auth_error::{AuthError, AuthResult};

const VERIFY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Serialize)]
struct SiteVerifyRequest<'a> {
    secret: &'a str,
    response: &'a str,
    remoteip: String,
}

#[derive(Debug, Deserialize)]
struct SiteVerifyResponse {
    success: bool,
    #[serde(default)]
    hostname: Option<String>,
    #[serde(default, rename = "error-codes")]
    error_codes: Vec<String>,
}

/// Verifies human-challenge responses against the Turnstile API
#[derive(Clone)]
pub struct TurnstileVerifier {
    client: reqwest::Client,
    secret: Option<String>,
    verify_url: String,
}

impl std::fmt::Debug for TurnstileVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnstileVerifier")
            .field("enabled", &self.secret.is_some())
            .field("verify_url", &self.verify_url)
            .finish()
    }
}

impl TurnstileVerifier {
    pub fn new(client: reqwest::Client, secret: Option<String>, verify_url: String) -> Self {
        Self {
            client,
            secret,
            verify_url,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Check a challenge response for `remote_ip`.
    ///
    /// Returns `Ok(())` only on an affirmative answer. With no secret
    /// configured every challenge is accepted.
    pub async fn verify(&self, challenge: &str, remote_ip: IpAddr) -> AuthResult<()> {
        let Some(secret) = self.secret.as_deref() else {
            warn!("TURNSTILE_SECRET not configured, accepting challenge without verification");
            return Ok(());
        };

        let payload = SiteVerifyRequest {
            secret,
            response: challenge,
            remoteip: remote_ip.to_string(),
        };

        let response = self
            .client
            .post(&self.verify_url)
            .timeout(VERIFY_TIMEOUT)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AuthError::VerificationUnavailable(e.to_string()))?;

        let body: SiteVerifyResponse = response
            .json()
            .await
            .map_err(|e| AuthError::VerificationUnavailable(e.to_string()))?;

        if body.success {
            debug!(ip = %remote_ip, hostname = ?body.hostname, "Turnstile challenge verified");
            Ok(())
        } else {
            warn!(ip = %remote_ip, error_codes = ?body.error_codes, "Turnstile challenge rejected");
            Err(AuthError::VerificationFailed)
        }
    }
}
