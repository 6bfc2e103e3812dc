use axum::{
    Extension,
    extract::{State, ws::WebSocketUpgrade},
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{error, info, warn};

use super::session::run_session;
use crate::errors::app_error::AppError;
use crate::middleware::{AdmissionTicket, ClientIp, SessionCredential};
use crate::state::AppState;

/// Chat frames are small JSON documents
const MAX_WS_FRAME_SIZE: usize = 64 * 1024;
const MAX_WS_MESSAGE_SIZE: usize = 64 * 1024;

/// Chat WebSocket handler
///
/// Runs after the origin, auth and connection limit middleware, so by the
/// time it is reached the credential is valid and a slot is held.
///
/// # Returns
/// * `Response` - HTTP response that upgrades the connection to WebSocket
pub async fn chat_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Extension(ticket): Extension<AdmissionTicket>,
    Extension(credential): Extension<SessionCredential>,
) -> Response {
    let Some(slot) = ticket.take() else {
        error!(ip = %ip, "Chat upgrade reached handler without an admission slot");
        return AppError::Internal("missing admission slot".to_string()).into_response();
    };

    info!(ip = %ip, "Chat WebSocket upgrade requested");

    let mut ws = ws
        .max_frame_size(MAX_WS_FRAME_SIZE)
        .max_message_size(MAX_WS_MESSAGE_SIZE)
        .write_buffer_size(0);
    if let Some(protocol) = credential.protocol {
        ws = ws.protocols([protocol]);
    }

    ws.on_failed_upgrade(move |e| warn!(ip = %ip, "Chat WebSocket upgrade failed: {}", e))
        .on_upgrade(move |socket| run_session(socket, state, slot))
}
