//! Browser chat WebSocket
//!
//! - `handler` - upgrade endpoint behind auth and admission middleware
//! - `session` - per-connection message loop and shutdown
//! - `relay` - lazy upstream connection and event pump
//! - `writer` - serialized socket writes and keepalive
//! - `messages` - wire types, validation and client-visible errors

pub mod handler;
pub mod messages;
mod relay;
mod session;
mod writer;

pub use handler::chat_handler;
pub use messages::{ClientMessage, ServerMessage};
