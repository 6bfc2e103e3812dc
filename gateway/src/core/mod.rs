//! Domain logic independent of the HTTP layer
//!
//! - `audio` - WAV to PCM16 conversion for the local pipeline
//! - `registry` - per-address admission control for chat connections
//! - `upstream` - realtime and local pipeline AI backends

pub mod audio;
pub mod registry;
pub mod upstream;

pub use registry::{ConnectionLimitError, ConnectionRegistry, ConnectionSlot};
pub use upstream::{UpstreamError, UpstreamEvent, UpstreamResult};
