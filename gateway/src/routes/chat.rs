//! Chat WebSocket route configuration

use axum::{Router, middleware, routing::get};
use tower_http::trace::TraceLayer;

use crate::handlers::chat::chat_handler;
use crate::middleware::{auth_middleware, connection_limit_middleware, origin_guard_middleware};
use crate::state::AppState;
use std::sync::Arc;

/// Create the chat WebSocket router
///
/// # Endpoint
///
/// `GET /ws/chat` - WebSocket upgrade for the chat relay
///
/// # Layers (outer to inner)
///
/// 1. `origin_guard_middleware` - 403 for a disallowed browser `Origin`
/// 2. `auth_middleware` - 401 unless the bearer credential validates
/// 3. `connection_limit_middleware` - 429 when the client IP is at capacity
///
/// Client IP resolution is applied around this router in
/// [`create_app`](super::create_app).
///
/// # Protocol
///
/// ```json
/// // Client sends
/// {"type": "message", "message": "Hello"}
///
/// // Server streams back
/// {"type": "text_delta", "text": "Hi"}
/// {"type": "text_done"}
/// {"type": "audio_delta", "audio": "<base64 pcm16>"}
/// {"type": "audio_done"}
/// {"type": "response_done"}
/// ```
pub fn create_chat_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/chat", get(chat_handler))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            connection_limit_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ))
        .layer(middleware::from_fn_with_state(
            state,
            origin_guard_middleware,
        ))
        .layer(TraceLayer::new_for_http())
}
