use crate::auth::Claims;
use crate::errors::auth_error::AuthError;
use crate::middleware::client_ip::ClientIp;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{HeaderMap, header},
    middleware::Next,
    response::Response,
};
use std::sync::Arc;

/// Credential accepted for a chat upgrade, inserted into request extensions
#[derive(Clone, Debug, Default)]
pub struct SessionCredential {
    pub claims: Claims,
    /// Set when the token arrived as a WebSocket subprotocol. The handshake
    /// must select it again or browsers abort the connection.
    pub protocol: Option<String>,
}

/// Where a bearer token was found
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSource {
    Header(String),
    Protocol(String),
}

impl TokenSource {
    pub fn token(&self) -> &str {
        match self {
            TokenSource::Header(t) | TokenSource::Protocol(t) => t,
        }
    }
}

/// Extract the bearer token from request headers
///
/// Browsers cannot set headers on a WebSocket handshake, so two sources are
/// supported:
/// 1. `Authorization: Bearer <token>` (preferred)
/// 2. `Sec-WebSocket-Protocol: <token>`: the first non-empty entry that is
///    not the literal `bearer` marker
///
/// A present `Authorization` header that is not a bearer credential is an
/// error rather than a fallthrough.
pub fn extract_token(headers: &HeaderMap) -> Result<Option<TokenSource>, AuthError> {
    if let Some(auth_header) = headers.get(header::AUTHORIZATION) {
        let auth_str = auth_header
            .to_str()
            .map_err(|_| AuthError::InvalidAuthHeader)?;

        return match auth_str.strip_prefix("Bearer ").map(str::trim) {
            Some(token) if !token.is_empty() => {
                tracing::debug!("Token extracted from Authorization header");
                Ok(Some(TokenSource::Header(token.to_string())))
            }
            _ => Err(AuthError::InvalidAuthHeader),
        };
    }

    let protocol = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|p| !p.is_empty() && !p.eq_ignore_ascii_case("bearer"));

    if let Some(token) = protocol {
        tracing::debug!("Token extracted from Sec-WebSocket-Protocol header");
        return Ok(Some(TokenSource::Protocol(token.to_string())));
    }

    Ok(None)
}

/// Authentication middleware for chat upgrades
///
/// Validates the bearer credential with the [`TokenIssuer`](crate::auth::TokenIssuer)
/// and inserts a [`SessionCredential`]. Failures return 401 before any
/// connection slot is taken. In open mode every request is accepted, with or
/// without a token.
pub async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let ip = request.extensions().get::<ClientIp>().map(|c| c.0);
    let issuer = &state.token_issuer;

    let source = match extract_token(request.headers()) {
        Ok(source) => source,
        Err(e) if issuer.is_open() => {
            tracing::debug!(?ip, "Ignoring malformed credential in open mode: {}", e);
            None
        }
        Err(e) => {
            tracing::warn!(?ip, "Rejecting upgrade: {}", e);
            return Err(e);
        }
    };

    let claims = match (&source, issuer.is_open()) {
        (Some(source), _) => issuer.validate(source.token()),
        (None, true) => issuer.validate(""),
        (None, false) => Err(AuthError::MissingToken),
    }
    .inspect_err(|e| tracing::warn!(?ip, "Rejecting upgrade: {}", e))?;

    tracing::debug!(?ip, exp = claims.exp, "Chat credential accepted");

    let protocol = match source {
        Some(TokenSource::Protocol(token)) => Some(token),
        _ => None,
    };
    request
        .extensions_mut()
        .insert(SessionCredential { claims, protocol });

    Ok(next.run(request).await)
}
