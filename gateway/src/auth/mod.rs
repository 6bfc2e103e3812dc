//! Bearer credential issuance and validation
//!
//! Credentials are HS256 JWTs carrying only `iat` and `exp`. When no signing
//! secret is configured the issuer runs in open mode: issuance returns the
//! fixed [`DEV_TOKEN`] and validation accepts any input. Open mode exists for
//! local development only and is logged loudly whenever it is exercised.
//!
//! # Example
//!
//! ```rust,no_run
//! use avatar_gateway::auth::TokenIssuer;
//! use std::time::Duration;
//!
//! let issuer = TokenIssuer::new(Some("secret".into()), Duration::from_secs(1800), None);
//! let token = issuer.issue_unconditional().unwrap();
//! assert!(issuer.validate(&token).is_ok());
//! ```

pub mod turnstile;

use std::net::IpAddr;
use std::time::Duration;

use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
    get_current_timestamp,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::errors::auth_error::{AuthError, AuthResult};

pub use turnstile::TurnstileVerifier;

/// Credential returned in open mode
pub const DEV_TOKEN: &str = "dev-token";

/// Claims carried by a session credential
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    pub exp: u64,
    pub iat: u64,
}

struct SigningKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

/// Mints and verifies short-lived session credentials
pub struct TokenIssuer {
    keys: Option<SigningKeys>,
    ttl: Duration,
    validation: Validation,
    turnstile: Option<TurnstileVerifier>,
}

impl TokenIssuer {
    /// Create an issuer. `secret = None` (or empty) enables open mode.
    ///
    /// Without a `turnstile` verifier every challenge is treated as affirmative.
    pub fn new(secret: Option<String>, ttl: Duration, turnstile: Option<TurnstileVerifier>) -> Self {
        let keys = secret.filter(|s| !s.is_empty()).map(|s| SigningKeys {
            encoding: EncodingKey::from_secret(s.as_bytes()),
            decoding: DecodingKey::from_secret(s.as_bytes()),
        });

        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp"]);

        Self {
            keys,
            ttl,
            validation,
            turnstile,
        }
    }

    pub fn is_open(&self) -> bool {
        self.keys.is_none()
    }

    /// Issue a credential without any verification step.
    pub fn issue_unconditional(&self) -> AuthResult<String> {
        let Some(keys) = &self.keys else {
            warn!("JWT_SECRET not configured, issuing development token");
            return Ok(DEV_TOKEN.to_string());
        };

        let now = get_current_timestamp();
        let claims = Claims {
            iat: now,
            exp: now + self.ttl.as_secs(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &keys.encoding)
            .map_err(|e| AuthError::SigningFailed(e.to_string()))
    }

    /// Verify a human challenge for `caller`, then issue a credential.
    pub async fn verify_and_issue(&self, challenge: &str, caller: IpAddr) -> AuthResult<String> {
        match &self.turnstile {
            Some(verifier) => verifier.verify(challenge, caller).await?,
            None => warn!(ip = %caller, "Turnstile not configured, skipping challenge verification"),
        }

        let token = self.issue_unconditional()?;
        info!(ip = %caller, "Challenge verified, credential issued");
        Ok(token)
    }

    /// Validate a presented credential.
    ///
    /// In open mode this succeeds for every input with empty claims.
    pub fn validate(&self, token: &str) -> AuthResult<Claims> {
        let Some(keys) = &self.keys else {
            warn!("JWT_SECRET not configured, accepting credential without validation");
            return Ok(Claims::default());
        };

        let data = decode::<Claims>(token, &keys.decoding, &self.validation)?;
        Ok(data.claims)
    }
}
