use axum::{
    Router,
    routing::{get, post},
};
use tower_http::trace::TraceLayer;

use crate::handlers::{api, auth};
use crate::state::AppState;
use std::sync::Arc;

/// Public routes that are never rate limited or authenticated
pub fn create_public_router() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(api::health_check))
}

/// Create the credential API router
///
/// These routes are how a browser obtains a credential, so they carry no
/// auth layer. The client IP and rate limit layers are applied in
/// [`create_app`](super::create_app).
pub fn create_api_router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/token", post(auth::issue_token))
        .route("/api/verify-turnstile", post(auth::verify_turnstile))
        .route("/api/turnstile-sitekey", get(auth::turnstile_site_key))
        .layer(TraceLayer::new_for_http())
}
