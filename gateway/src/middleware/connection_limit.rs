//! Connection limit middleware for chat WebSocket connections
//!
//! Enforces the per-address limit of the [`ConnectionRegistry`] before the
//! upgrade is accepted. The acquired [`ConnectionSlot`] travels to the handler
//! inside an [`AdmissionTicket`]; if the request never reaches the session the
//! ticket is dropped with the request and the slot is released.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use avatar_gateway::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/ws/chat", get(chat_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```
//!
//! [`ConnectionRegistry`]: crate::core::registry::ConnectionRegistry

use axum::{
    Extension, Json,
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use crate::core::registry::{ConnectionLimitError, ConnectionSlot};
use crate::middleware::client_ip::ClientIp;
use crate::state::AppState;

/// Carries an admitted slot from the middleware to the handler.
///
/// Request extensions must be `Clone`, so the slot sits behind a shared
/// `Option` and is moved out exactly once with [`AdmissionTicket::take`].
#[derive(Clone, Debug)]
pub struct AdmissionTicket(Arc<Mutex<Option<ConnectionSlot>>>);

impl AdmissionTicket {
    fn new(slot: ConnectionSlot) -> Self {
        Self(Arc::new(Mutex::new(Some(slot))))
    }

    pub fn take(&self) -> Option<ConnectionSlot> {
        self.0.lock().take()
    }
}

fn is_websocket_upgrade(request: &Request) -> bool {
    request
        .headers()
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

/// Middleware that enforces the per-IP connection limit.
///
/// Returns 429 Too Many Requests when the client address already holds the
/// maximum number of chat connections. Non-upgrade requests pass through.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    Extension(ClientIp(client_ip)): Extension<ClientIp>,
    mut request: Request,
    next: Next,
) -> Response {
    if !is_websocket_upgrade(&request) {
        return next.run(request).await;
    }

    match state.registry.try_acquire(client_ip) {
        Ok(slot) => {
            tracing::debug!(
                ip = %client_ip,
                active = state.registry.count(&client_ip),
                "Connection admitted"
            );
            request.extensions_mut().insert(AdmissionTicket::new(slot));
            next.run(request).await
        }
        Err(ConnectionLimitError::PerIpLimitReached { ip, limit }) => {
            tracing::warn!(ip = %ip, limit, "Rejecting connection: per-IP limit reached");
            (
                StatusCode::TOO_MANY_REQUESTS,
                Json(json!({ "error": "Too many concurrent connections from your IP address" })),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::ConnectionRegistry;
    use std::net::{IpAddr, Ipv4Addr};

    #[test]
    fn test_ticket_yields_slot_once() {
        let registry = ConnectionRegistry::new(2);
        let ip: IpAddr = Ipv4Addr::new(192, 168, 1, 100).into();

        let ticket = AdmissionTicket::new(registry.try_acquire(ip).unwrap());
        let copy = ticket.clone();
        assert_eq!(registry.count(&ip), 1);

        let slot = copy.take().expect("first take yields the slot");
        assert!(ticket.take().is_none());
        assert_eq!(registry.count(&ip), 1);

        drop(slot);
        assert_eq!(registry.count(&ip), 0);
    }

    #[test]
    fn test_dropped_ticket_releases_slot() {
        let registry = ConnectionRegistry::new(1);
        let ip: IpAddr = Ipv4Addr::LOCALHOST.into();

        let ticket = AdmissionTicket::new(registry.try_acquire(ip).unwrap());
        assert!(registry.try_acquire(ip).is_err());

        drop(ticket);
        assert_eq!(registry.count(&ip), 0);
        assert!(registry.try_acquire(ip).is_ok());
    }
}
