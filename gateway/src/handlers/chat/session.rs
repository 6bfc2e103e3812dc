//! One browser chat connection from upgrade to close
//!
//! The session owns the socket's read half and runs the message loop. Three
//! background tasks share its done signal: the writer, the keepalive pinger
//! and (realtime only) the upstream pump of the current connection. Whichever
//! side fails first fires done; everything else observes it and exits.

use axum::extract::ws::{Message, WebSocket};
use futures::StreamExt;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::messages::{ClientMessage, ERR_BUSY, ERR_INVALID_TYPE, ERR_RATE_LIMITED, validate_message};
use super::relay::{Relay, RelayContext};
use super::writer::{KeepaliveContext, Outbox, WRITE_TIMEOUT, WriterContext, keepalive, write_loop};
use crate::core::registry::ConnectionSlot;
use crate::state::AppState;

/// Token bucket allowing `burst` messages, refilled one per `period`.
pub(super) fn message_limiter(period: Duration, burst: u32) -> DefaultDirectRateLimiter {
    let burst = NonZeroU32::new(burst).unwrap_or(NonZeroU32::MIN);
    let quota = Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
        .allow_burst(burst);
    RateLimiter::direct(quota)
}

struct ChatSession {
    client_ip: IpAddr,
    outbox: Outbox,
    limiter: DefaultDirectRateLimiter,
    relay: Relay,
    max_message_length: usize,
    strict_single_flight: bool,
}

impl ChatSession {
    async fn handle_text(&mut self, text: &str) {
        let ip = self.client_ip;

        let message: ClientMessage = match serde_json::from_str(text) {
            Ok(message) => message,
            Err(e) => {
                warn!(ip = %ip, "Malformed chat frame: {}", e);
                self.outbox.error(ERR_INVALID_TYPE).await;
                return;
            }
        };

        if message.kind != ClientMessage::MESSAGE {
            warn!(ip = %ip, kind = %message.kind, "Unknown chat message type");
            self.outbox.error(ERR_INVALID_TYPE).await;
            return;
        }

        if self.limiter.check().is_err() {
            warn!(ip = %ip, "Message rate limit exceeded");
            self.outbox.error(ERR_RATE_LIMITED).await;
            return;
        }

        let clean = match validate_message(&message.message, self.max_message_length) {
            Ok(clean) => clean,
            Err(rejection) => {
                debug!(ip = %ip, ?rejection, "Rejected user message");
                self.outbox.error(rejection.client_message()).await;
                return;
            }
        };

        if self.strict_single_flight && self.relay.is_busy() {
            debug!(ip = %ip, "Reply still streaming, rejecting message");
            self.outbox.error(ERR_BUSY).await;
            return;
        }

        self.relay.handle(clean).await;
    }
}

/// Run a chat session on an upgraded socket. The slot is released on return.
pub async fn run_session(socket: WebSocket, state: Arc<AppState>, slot: ConnectionSlot) {
    let client_ip = slot.ip();
    let session_id = Uuid::new_v4();
    let config = &state.config;
    let (ws_sink, mut ws_stream) = socket.split();

    let done = CancellationToken::new();
    let (outbox, rx) = Outbox::channel();

    let writer = tokio::spawn(write_loop(WriterContext {
        sink: ws_sink,
        rx,
        done: done.clone(),
        client_ip,
        write_timeout: WRITE_TIMEOUT,
    }));
    let pinger = tokio::spawn(keepalive(KeepaliveContext {
        outbox: outbox.clone(),
        done: done.clone(),
        interval: config.ping_interval(),
        client_ip,
    }));

    let relay = Relay::new(
        &state.upstream,
        Arc::from(config.system_prompt.as_str()),
        RelayContext {
            outbox: outbox.clone(),
            done: done.clone(),
            client_ip,
        },
    );
    let mut session = ChatSession {
        client_ip,
        outbox,
        limiter: message_limiter(config.message_rate_period(), config.message_burst),
        relay,
        max_message_length: config.max_message_length,
        strict_single_flight: config.strict_single_flight,
    };

    let lifetime = config.connection_timeout();
    let mut deadline = Instant::now() + lifetime;

    info!(ip = %client_ip, session_id = %session_id, backend = state.upstream.name(), "Chat session started");

    loop {
        let frame = tokio::select! {
            _ = done.cancelled() => {
                debug!(ip = %client_ip, "Done signal fired");
                break;
            }
            _ = sleep_until(deadline) => {
                info!(ip = %client_ip, "Chat connection deadline reached");
                break;
            }
            frame = ws_stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => session.handle_text(text.as_str()).await,
            // Pongs are queued by the socket itself; both refresh the deadline
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {
                deadline = Instant::now() + lifetime;
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(ip = %client_ip, len = data.len(), "Ignoring binary frame");
            }
            Some(Ok(Message::Close(frame))) => {
                info!(ip = %client_ip, ?frame, "Browser closed the connection");
                break;
            }
            Some(Err(e)) => {
                warn!(ip = %client_ip, "WebSocket read failed: {}", e);
                break;
            }
            None => break,
        }
    }

    done.cancel();
    session.relay.shutdown().await;
    drop(session);

    for (name, task) in [("writer", writer), ("keepalive", pinger)] {
        if let Err(e) = task.await {
            warn!(ip = %client_ip, task = name, "Session task ended abnormally: {}", e);
        }
    }

    drop(slot);
    info!(ip = %client_ip, session_id = %session_id, "Chat session ended");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_burst_then_reject() {
        let limiter = message_limiter(Duration::from_secs(5), 3);
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_ok());
        assert!(limiter.check().is_err());
    }

    #[test]
    fn test_limiter_zero_values_fall_back() {
        let limiter = message_limiter(Duration::ZERO, 0);
        assert!(limiter.check().is_ok());
    }

    #[test]
    fn test_limiters_are_independent() {
        let a = message_limiter(Duration::from_secs(5), 1);
        let b = message_limiter(Duration::from_secs(5), 1);
        assert!(a.check().is_ok());
        assert!(a.check().is_err());
        assert!(b.check().is_ok());
    }
}
