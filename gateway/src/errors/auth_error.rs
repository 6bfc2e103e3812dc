use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Errors produced while issuing or validating bearer credentials
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Missing bearer credential")]
    MissingToken,

    #[error("Invalid Authorization header format")]
    InvalidAuthHeader,

    #[error("Invalid or expired token: {0}")]
    InvalidOrExpired(#[from] jsonwebtoken::errors::Error),

    #[error("Human verification rejected the challenge")]
    VerificationFailed,

    #[error("Human verification request failed: {0}")]
    VerificationUnavailable(String),

    #[error("Token signing failed: {0}")]
    SigningFailed(String),
}

pub type AuthResult<T> = Result<T, AuthError>;

impl AuthError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidAuthHeader
            | AuthError::InvalidOrExpired(_)
            | AuthError::VerificationFailed => StatusCode::UNAUTHORIZED,
            AuthError::VerificationUnavailable(_) | AuthError::SigningFailed(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Message safe to return to a browser. Never includes internal detail.
    pub fn public_message(&self) -> &'static str {
        match self {
            AuthError::MissingToken
            | AuthError::InvalidAuthHeader
            | AuthError::InvalidOrExpired(_) => "Authentication required",
            AuthError::VerificationFailed | AuthError::VerificationUnavailable(_) => {
                "Verification failed"
            }
            AuthError::SigningFailed(_) => "Token generation failed",
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        (
            self.status_code(),
            Json(json!({ "error": self.public_message() })),
        )
            .into_response()
    }
}
