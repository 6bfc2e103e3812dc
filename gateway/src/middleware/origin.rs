//! Allowed browser origins
//!
//! One [`OriginPolicy`] drives both the CORS layer and the `Origin` check on
//! WebSocket upgrades, which CORS does not cover.

use axum::{
    extract::{Request, State},
    http::{HeaderName, HeaderValue, Method, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{info, warn};

use crate::errors::app_error::AppError;
use crate::middleware::client_ip::ClientIp;
use crate::state::AppState;

/// Origins permitted to call the gateway from a browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    /// `*`: any origin, without credentials
    Any,
    /// Exact origin strings such as `https://example.com`
    List(Vec<String>),
    /// Nothing configured: only same-origin requests
    SameOrigin,
}

impl OriginPolicy {
    /// Parse the comma separated `CORS_ALLOWED_ORIGINS` value.
    pub fn from_config(value: Option<&str>) -> Self {
        let Some(value) = value.map(str::trim) else {
            return OriginPolicy::SameOrigin;
        };
        if value == "*" {
            return OriginPolicy::Any;
        }

        let origins: Vec<String> = value
            .split(',')
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect();

        if origins.is_empty() {
            OriginPolicy::SameOrigin
        } else {
            OriginPolicy::List(origins)
        }
    }

    /// Whether a request carrying `origin` for `host` may proceed.
    pub fn allows(&self, origin: &str, host: Option<&str>) -> bool {
        let origin = origin.trim_end_matches('/');
        match self {
            OriginPolicy::Any => true,
            OriginPolicy::List(origins) => origins.iter().any(|o| o.eq_ignore_ascii_case(origin)),
            OriginPolicy::SameOrigin => {
                let authority = origin.split_once("://").map(|(_, rest)| rest);
                matches!((authority, host), (Some(a), Some(h)) if a.eq_ignore_ascii_case(h))
            }
        }
    }

    /// CORS layer for the HTTP routes.
    pub fn cors_layer(&self) -> CorsLayer {
        let base = CorsLayer::new()
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([
                header::ORIGIN,
                header::CONTENT_TYPE,
                header::ACCEPT,
                header::AUTHORIZATION,
                header::UPGRADE,
                header::CONNECTION,
                HeaderName::from_static("sec-websocket-protocol"),
            ]);

        match self {
            OriginPolicy::Any => base.allow_origin(Any).allow_credentials(false),
            OriginPolicy::List(origins) => {
                let values: Vec<HeaderValue> =
                    origins.iter().filter_map(|o| o.parse().ok()).collect();
                base.allow_origin(AllowOrigin::list(values))
                    .allow_credentials(true)
            }
            OriginPolicy::SameOrigin => {
                info!(
                    "CORS not configured, defaulting to same-origin only. \
                     Set CORS_ALLOWED_ORIGINS to enable cross-origin access."
                );
                base.allow_credentials(false)
            }
        }
    }
}

/// Refuse WebSocket upgrades whose `Origin` is not allowed.
///
/// Requests without an `Origin` header (non-browser clients) pass through.
pub async fn origin_guard_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let headers = request.headers();
    if let Some(origin) = headers.get(header::ORIGIN) {
        let host = headers.get(header::HOST).and_then(|v| v.to_str().ok());
        let allowed = origin
            .to_str()
            .is_ok_and(|o| state.origins.allows(o, host));

        if !allowed {
            let ip = request.extensions().get::<ClientIp>().map(|c| c.0);
            warn!(?ip, origin = ?origin, "Rejecting WebSocket upgrade from disallowed origin");
            return AppError::Forbidden("Origin not allowed".to_string()).into_response();
        }
    }

    next.run(request).await
}
