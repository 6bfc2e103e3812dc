//! Credential endpoints
//!
//! - `POST /api/token` issues a credential without any challenge
//! - `POST /api/verify-turnstile` verifies a Turnstile challenge, then issues
//! - `GET /api/turnstile-sitekey` exposes the public site key to the browser

use axum::{
    Extension,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

use crate::errors::app_error::AppResult;
use crate::middleware::client_ip::ClientIp;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub jwt: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyTurnstileRequest {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct VerifyTurnstileResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl VerifyTurnstileResponse {
    fn failure(status: StatusCode, error: &'static str) -> Response {
        (
            status,
            Json(Self {
                success: false,
                jwt: None,
                error: Some(error),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
pub struct SiteKeyResponse {
    #[serde(rename = "siteKey")]
    pub site_key: String,
}

/// Issue a credential unconditionally.
pub async fn issue_token(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
) -> AppResult<Json<TokenResponse>> {
    let jwt = state
        .token_issuer
        .issue_unconditional()
        .inspect_err(|e| error!(ip = %ip, "Failed to issue token: {}", e))?;
    Ok(Json(TokenResponse { jwt }))
}

/// Verify a Turnstile challenge and issue a credential.
pub async fn verify_turnstile(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    payload: Result<Json<VerifyTurnstileRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) if !request.token.trim().is_empty() => request,
        Ok(_) => {
            warn!(ip = %ip, "Turnstile request without token");
            return VerifyTurnstileResponse::failure(StatusCode::BAD_REQUEST, "Invalid request");
        }
        Err(rejection) => {
            warn!(ip = %ip, "Malformed Turnstile request: {}", rejection.body_text());
            return VerifyTurnstileResponse::failure(StatusCode::BAD_REQUEST, "Invalid request");
        }
    };

    match state.token_issuer.verify_and_issue(&request.token, ip).await {
        Ok(jwt) => Json(VerifyTurnstileResponse {
            success: true,
            jwt: Some(jwt),
            error: None,
        })
        .into_response(),
        Err(e) => {
            warn!(ip = %ip, "Turnstile verification did not issue a token: {}", e);
            VerifyTurnstileResponse::failure(e.status_code(), e.public_message())
        }
    }
}

/// Public Turnstile site key for the browser widget.
pub async fn turnstile_site_key(State(state): State<Arc<AppState>>) -> Json<SiteKeyResponse> {
    Json(SiteKeyResponse {
        site_key: state.config.turnstile_site_key.clone(),
    })
}
