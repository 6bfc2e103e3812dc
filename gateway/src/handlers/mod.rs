//! HTTP and WebSocket request handlers
//!
//! This module organizes all API handlers into logical groups:
//! - `api` - Health check endpoint
//! - `auth` - Credential issuance and Turnstile verification
//! - `chat` - Browser chat WebSocket relay

pub mod api;
pub mod auth;
pub mod chat;

// Re-export commonly used handlers for convenient access
pub use chat::chat_handler;
