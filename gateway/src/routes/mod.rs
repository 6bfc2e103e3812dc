pub mod api;
pub mod chat;

use axum::{Router, middleware};
use http::HeaderValue;
use std::sync::Arc;
use tower_governor::{GovernorLayer, governor::GovernorConfigBuilder};
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::{info, warn};

use crate::middleware::{ClientIpKeyExtractor, client_ip_middleware};
use crate::state::AppState;

/// Rates at or above this disable the HTTP rate limiter
const RATE_LIMIT_DISABLED_AT: u32 = 100_000;

/// Build the complete application router.
///
/// Layout:
/// - `/health` (public)
/// - `/api/*` (client IP + per-IP rate limit)
/// - `/ws/chat` (client IP + origin + auth + admission)
///
/// CORS and security headers wrap everything. The returned router must be
/// served with `into_make_service_with_connect_info::<SocketAddr>()`.
pub fn create_app(state: Arc<AppState>) -> Router {
    let config = &state.config;

    let governor_layer = if config.rate_limit_requests_per_second < RATE_LIMIT_DISABLED_AT {
        let built = GovernorConfigBuilder::default()
            .per_second(u64::from(config.rate_limit_requests_per_second.max(1)))
            .burst_size(config.rate_limit_burst_size.max(1))
            .key_extractor(ClientIpKeyExtractor)
            .finish();
        match built {
            Some(governor_config) => Some(GovernorLayer::new(governor_config)),
            None => {
                warn!("Invalid rate limiter settings, HTTP rate limiting disabled");
                None
            }
        }
    } else {
        info!("Rate limiting disabled (rate >= {}/s)", RATE_LIMIT_DISABLED_AT);
        None
    };

    let api_routes = api::create_api_router().layer(tower::util::option_layer(governor_layer));

    let client_routes = api_routes
        .merge(chat::create_chat_router(state.clone()))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            client_ip_middleware,
        ));

    // Security headers
    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ));

    let cors_layer = state.origins.cors_layer();

    api::create_public_router()
        .merge(client_routes)
        .with_state(state)
        .layer(cors_layer)
        .layer(security_headers)
}
