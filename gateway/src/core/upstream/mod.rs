//! Upstream AI backends for chat sessions
//!
//! Two interchangeable backends answer user messages:
//!
//! - [`realtime`]: one persistent duplex WebSocket per session speaking the
//!   OpenAI realtime protocol. Modelled as a [`RealtimeConnector`] that yields
//!   a writable [`RealtimeSink`] and a readable [`RealtimeEvents`] half so the
//!   session can pump events on a separate task.
//! - [`local`]: an OpenAI-compatible chat completion endpoint (SSE) followed
//!   by a text-to-speech endpoint. Every exchange is a fresh pair of HTTP calls.
//!
//! Both surface results as [`UpstreamEvent`] values, which map one-to-one onto
//! the frames the browser receives.

use async_trait::async_trait;
use thiserror::Error;

use super::audio::AudioError;

pub mod local;
pub mod realtime;

pub use local::{CompletionEvent, LocalPipeline};
pub use realtime::OpenAIRealtimeConnector;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by upstream backends
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Transport failure while connecting or calling the upstream
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    /// Upstream answered with a non-success status
    #[error("Upstream returned status {0}")]
    BadStatus(u16),

    /// Session configuration could not be delivered
    #[error("Session configuration rejected: {0}")]
    ConfigRejected(String),

    /// A client event could not be written to the upstream socket
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// The upstream event stream closed or failed
    #[error("Upstream stream ended")]
    StreamEnded,

    /// The upstream sent something that could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio conversion failed: {0}")]
    Audio(#[from] AudioError),
}

/// Result type for upstream operations
pub type UpstreamResult<T> = Result<T, UpstreamError>;

// =============================================================================
// Events
// =============================================================================

/// Upstream events after mapping from the vendor protocol
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpstreamEvent {
    /// Incremental assistant text (realtime: audio transcript)
    TextDelta(String),
    TextDone,
    /// Base64 encoded PCM16 little-endian, mono, 24 kHz
    AudioDelta(String),
    AudioDone,
    ResponseDone,
    /// Vendor-reported error. Logged by the session, never forwarded.
    Error(String),
    /// Any event type the gateway does not forward
    Unrecognized(String),
}

// =============================================================================
// Realtime seam
// =============================================================================

/// An open realtime upstream connection split into its two halves
pub struct RealtimeConnection {
    pub sink: Box<dyn RealtimeSink>,
    pub events: Box<dyn RealtimeEvents>,
}

/// Opens realtime upstream connections
#[async_trait]
pub trait RealtimeConnector: Send + Sync {
    async fn connect(&self) -> UpstreamResult<RealtimeConnection>;
}

/// Write half of a realtime connection
#[async_trait]
pub trait RealtimeSink: Send {
    /// Set persona instructions, voice and audio output modality.
    ///
    /// Must be called once per connection before any user content.
    async fn configure(&mut self, system_prompt: &str) -> UpstreamResult<()>;

    /// Append a user text item to the conversation.
    async fn send_user_text(&mut self, text: &str) -> UpstreamResult<()>;

    /// Ask the upstream to generate a response for the conversation so far.
    async fn request_response(&mut self) -> UpstreamResult<()>;

    /// Close the connection. Errors are logged, not returned.
    async fn close(&mut self);
}

/// Read half of a realtime connection
#[async_trait]
pub trait RealtimeEvents: Send {
    /// Wait for the next event. `Err(StreamEnded)` once the connection is gone.
    async fn next_event(&mut self) -> UpstreamResult<UpstreamEvent>;
}
