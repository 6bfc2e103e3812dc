//! Per-session upstream relay
//!
//! The realtime relay keeps at most one upstream connection per session in an
//! [`UpstreamState`] behind a single mutex. The connection is opened lazily by
//! the first user message, and again after any failure. Each open connection
//! gets one pump task that forwards its events to the browser. A pump that
//! outlives its connection cannot clobber a newer one: invalidation checks the
//! generation it was started with.
//!
//! The local relay runs one chat completion + TTS exchange per message and
//! cancels it when the session ends.

use futures::StreamExt;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::messages::{
    ERR_CONFIGURE_FAILED, ERR_CONNECT_FAILED, ERR_GENERATE_FAILED, ERR_REQUEST_FAILED,
    ERR_SEND_FAILED, ServerMessage,
};
use super::writer::Outbox;
use crate::core::upstream::{
    LocalPipeline, RealtimeConnection, RealtimeConnector, RealtimeEvents, RealtimeSink,
    UpstreamEvent,
};
use crate::state::UpstreamBackend;

/// What every relay needs from its session
#[derive(Clone)]
pub(super) struct RelayContext {
    pub outbox: Outbox,
    pub done: CancellationToken,
    pub client_ip: IpAddr,
}

pub(super) enum Relay {
    Realtime(RealtimeRelay),
    Local(LocalRelay),
}

impl Relay {
    pub(super) fn new(backend: &UpstreamBackend, system_prompt: Arc<str>, ctx: RelayContext) -> Self {
        match backend {
            UpstreamBackend::Realtime(connector) => Relay::Realtime(RealtimeRelay {
                connector: Arc::clone(connector),
                system_prompt,
                state: Arc::new(Mutex::new(UpstreamState::NoHandle)),
                in_flight: Arc::new(AtomicBool::new(false)),
                generation: 0,
                ctx,
            }),
            UpstreamBackend::Local(pipeline) => Relay::Local(LocalRelay {
                pipeline: Arc::clone(pipeline),
                ctx,
            }),
        }
    }

    /// Forward one sanitized user message upstream.
    pub(super) async fn handle(&mut self, text: String) {
        match self {
            Relay::Realtime(relay) => relay.handle(&text).await,
            Relay::Local(relay) => relay.handle(text).await,
        }
    }

    /// True while a realtime reply is still streaming.
    pub(super) fn is_busy(&self) -> bool {
        match self {
            Relay::Realtime(relay) => relay.in_flight.load(Ordering::Acquire),
            // Local exchanges run to completion before the next message is read
            Relay::Local(_) => false,
        }
    }

    pub(super) async fn shutdown(&mut self) {
        if let Relay::Realtime(relay) = self {
            relay.shutdown().await;
        }
    }
}

// =============================================================================
// Realtime
// =============================================================================

pub(super) enum UpstreamState {
    NoHandle,
    Open(OpenHandle),
    Failed,
}

pub(super) struct OpenHandle {
    sink: Box<dyn RealtimeSink>,
    pump: JoinHandle<()>,
    generation: u64,
}

pub(super) struct RealtimeRelay {
    connector: Arc<dyn RealtimeConnector>,
    system_prompt: Arc<str>,
    state: Arc<Mutex<UpstreamState>>,
    in_flight: Arc<AtomicBool>,
    generation: u64,
    ctx: RelayContext,
}

impl RealtimeRelay {
    /// Return the open handle, connecting and configuring one if needed.
    ///
    /// On failure the client-visible error is returned and the state is left
    /// without an open handle.
    async fn ensure_open<'a>(
        &mut self,
        state: &'a mut UpstreamState,
    ) -> Result<&'a mut OpenHandle, &'static str> {
        if !matches!(state, UpstreamState::Open(_)) {
            let ip = self.ctx.client_ip;
            let RealtimeConnection { mut sink, events } =
                self.connector.connect().await.map_err(|e| {
                    warn!(ip = %ip, "Realtime upstream connect failed: {}", e);
                    ERR_CONNECT_FAILED
                })?;

            if let Err(e) = sink.configure(&self.system_prompt).await {
                warn!(ip = %ip, "Realtime session configuration failed: {}", e);
                sink.close().await;
                *state = UpstreamState::Failed;
                return Err(ERR_CONFIGURE_FAILED);
            }

            self.generation += 1;
            let generation = self.generation;
            let pump = tokio::spawn(pump_events(PumpContext {
                events,
                generation,
                state: Arc::clone(&self.state),
                in_flight: Arc::clone(&self.in_flight),
                outbox: self.ctx.outbox.clone(),
                done: self.ctx.done.clone(),
                client_ip: ip,
            }));

            info!(ip = %ip, generation, "Realtime upstream connected");
            *state = UpstreamState::Open(OpenHandle {
                sink,
                pump,
                generation,
            });
        }

        match state {
            UpstreamState::Open(handle) => Ok(handle),
            _ => Err(ERR_CONNECT_FAILED),
        }
    }

    async fn handle(&mut self, text: &str) {
        let ip = self.ctx.client_ip;
        let shared = Arc::clone(&self.state);
        let mut state = shared.lock().await;

        let handle = match self.ensure_open(&mut state).await {
            Ok(handle) => handle,
            Err(message) => {
                self.ctx.outbox.error(message).await;
                return;
            }
        };
        let generation = handle.generation;

        if let Err(e) = handle.sink.send_user_text(text).await {
            warn!(ip = %ip, generation, "Failed to send user text upstream: {}", e);
            invalidate(&mut state).await;
            self.ctx.outbox.error(ERR_SEND_FAILED).await;
            return;
        }

        self.in_flight.store(true, Ordering::Release);
        if let Err(e) = handle.sink.request_response().await {
            warn!(ip = %ip, generation, "Failed to request response: {}", e);
            self.in_flight.store(false, Ordering::Release);
            invalidate(&mut state).await;
            self.ctx.outbox.error(ERR_REQUEST_FAILED).await;
            return;
        }

        debug!(ip = %ip, generation, chars = text.chars().count(), "User message dispatched");
    }

    async fn shutdown(&mut self) {
        let mut state = self.state.lock().await;
        if let UpstreamState::Open(mut handle) =
            std::mem::replace(&mut *state, UpstreamState::NoHandle)
        {
            handle.pump.abort();
            handle.sink.close().await;
            debug!(ip = %self.ctx.client_ip, generation = handle.generation, "Realtime upstream closed");
        }
    }
}

/// Drop the open handle, if any, and mark the upstream failed.
async fn invalidate(state: &mut UpstreamState) {
    if let UpstreamState::Open(mut handle) = std::mem::replace(state, UpstreamState::Failed) {
        handle.pump.abort();
        handle.sink.close().await;
    }
}

struct PumpContext {
    events: Box<dyn RealtimeEvents>,
    generation: u64,
    state: Arc<Mutex<UpstreamState>>,
    in_flight: Arc<AtomicBool>,
    outbox: Outbox,
    done: CancellationToken,
    client_ip: IpAddr,
}

/// Forward upstream events to the browser until the connection ends.
async fn pump_events(mut ctx: PumpContext) {
    let ip = ctx.client_ip;
    let generation = ctx.generation;

    loop {
        let event = tokio::select! {
            _ = ctx.done.cancelled() => return,
            event = ctx.events.next_event() => event,
        };

        match event {
            Ok(UpstreamEvent::Error(detail)) => {
                warn!(ip = %ip, generation, "Realtime upstream reported error: {}", detail);
            }
            Ok(UpstreamEvent::Unrecognized(kind)) => {
                debug!(ip = %ip, generation, kind = %kind, "Ignoring realtime event");
            }
            Ok(event) => {
                if event == UpstreamEvent::ResponseDone {
                    ctx.in_flight.store(false, Ordering::Release);
                }
                if let Some(frame) = ServerMessage::from_upstream(event)
                    && !ctx.outbox.send(frame).await
                {
                    return;
                }
            }
            Err(e) => {
                info!(ip = %ip, generation, "Realtime upstream stream ended: {}", e);
                break;
            }
        }
    }

    ctx.in_flight.store(false, Ordering::Release);

    // Only clear the handle this pump belongs to
    let mut state = ctx.state.lock().await;
    let current = matches!(&*state, UpstreamState::Open(handle) if handle.generation == generation);
    if current
        && let UpstreamState::Open(mut handle) =
            std::mem::replace(&mut *state, UpstreamState::Failed)
    {
        handle.sink.close().await;
        debug!(ip = %ip, generation, "Realtime upstream invalidated, next message reconnects");
    }
}

// =============================================================================
// Local pipeline
// =============================================================================

pub(super) struct LocalRelay {
    pipeline: Arc<LocalPipeline>,
    ctx: RelayContext,
}

impl LocalRelay {
    async fn handle(&mut self, text: String) {
        let ip = self.ctx.client_ip;
        let exchange = self.pipeline.run_exchange(text);
        futures::pin_mut!(exchange);

        loop {
            let item = tokio::select! {
                _ = self.ctx.done.cancelled() => {
                    debug!(ip = %ip, "Session ended mid-exchange, cancelling local pipeline");
                    return;
                }
                item = exchange.next() => item,
            };

            match item {
                None => return,
                Some(Ok(event)) => {
                    if let Some(frame) = ServerMessage::from_upstream(event)
                        && !self.ctx.outbox.send(frame).await
                    {
                        return;
                    }
                }
                Some(Err(e)) => {
                    warn!(ip = %ip, "Local pipeline exchange failed: {}", e);
                    self.ctx.outbox.error(ERR_GENERATE_FAILED).await;
                    return;
                }
            }
        }
    }
}
