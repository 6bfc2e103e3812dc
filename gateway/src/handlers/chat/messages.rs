//! Chat WebSocket message types
//!
//! Client → server:
//! ```json
//! {"type": "message", "message": "Hello"}
//! ```
//!
//! Server → client, one JSON text frame each:
//! `text_delta{text}`, `text_done`, `audio_delta{audio}`, `audio_done`,
//! `response_done`, `error{error}`.

use serde::{Deserialize, Serialize};

use crate::core::upstream::UpstreamEvent;

// =============================================================================
// Client-visible error strings
// =============================================================================

pub const ERR_RATE_LIMITED: &str =
    "Rate limit exceeded. Please wait before sending another message.";
pub const ERR_EMPTY_MESSAGE: &str = "Message cannot be empty";
pub const ERR_INVALID_TYPE: &str = "Invalid message type";
pub const ERR_CONNECT_FAILED: &str = "Failed to connect to AI service";
pub const ERR_CONFIGURE_FAILED: &str = "Failed to configure AI session";
pub const ERR_SEND_FAILED: &str = "Failed to send message";
pub const ERR_REQUEST_FAILED: &str = "Failed to request response";
pub const ERR_GENERATE_FAILED: &str = "Failed to generate response";
pub const ERR_BUSY: &str = "Please wait for the current response to finish";

// =============================================================================
// Incoming
// =============================================================================

/// Frame sent by the browser
#[derive(Debug, Clone, Deserialize)]
pub struct ClientMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub message: String,
}

impl ClientMessage {
    pub const MESSAGE: &'static str = "message";
}

/// Why a user message was not accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageRejection {
    Empty,
    Length { max: usize },
}

impl MessageRejection {
    pub fn client_message(&self) -> String {
        match self {
            MessageRejection::Empty => ERR_EMPTY_MESSAGE.to_string(),
            MessageRejection::Length { max } => {
                format!("Message must be between 1 and {max} characters")
            }
        }
    }
}

/// Trim and drop control characters other than `\n` and `\t`.
pub fn sanitize_message(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|c| *c == '\n' || *c == '\t' || (*c as u32) >= 32)
        .collect()
}

/// Bounds-check and sanitize a user message.
///
/// Length is counted in characters on the raw input.
pub fn validate_message(raw: &str, max_len: usize) -> Result<String, MessageRejection> {
    if raw.is_empty() {
        return Err(MessageRejection::Empty);
    }
    if raw.chars().count() > max_len {
        return Err(MessageRejection::Length { max: max_len });
    }

    let clean = sanitize_message(raw);
    if clean.is_empty() {
        return Err(MessageRejection::Empty);
    }
    Ok(clean)
}

// =============================================================================
// Outgoing
// =============================================================================

/// Frame sent to the browser
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    TextDelta { text: String },
    TextDone,
    /// Base64 PCM16 little-endian, mono, 24 kHz
    AudioDelta { audio: String },
    AudioDone,
    ResponseDone,
    Error { error: String },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: message.into(),
        }
    }

    /// Browser frame for an upstream event, if it is forwarded at all.
    pub fn from_upstream(event: UpstreamEvent) -> Option<Self> {
        match event {
            UpstreamEvent::TextDelta(text) => Some(ServerMessage::TextDelta { text }),
            UpstreamEvent::TextDone => Some(ServerMessage::TextDone),
            UpstreamEvent::AudioDelta(audio) => Some(ServerMessage::AudioDelta { audio }),
            UpstreamEvent::AudioDone => Some(ServerMessage::AudioDone),
            UpstreamEvent::ResponseDone => Some(ServerMessage::ResponseDone),
            UpstreamEvent::Error(_) | UpstreamEvent::Unrecognized(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_message() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"message","message":"hi"}"#).unwrap();
        assert_eq!(msg.kind, ClientMessage::MESSAGE);
        assert_eq!(msg.message, "hi");

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.kind, "ping");
        assert!(msg.message.is_empty());
    }

    #[test]
    fn test_server_message_wire_format() {
        assert_eq!(
            serde_json::to_value(ServerMessage::TextDelta { text: "a".into() }).unwrap(),
            json!({ "type": "text_delta", "text": "a" })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::AudioDelta { audio: "AA==".into() }).unwrap(),
            json!({ "type": "audio_delta", "audio": "AA==" })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::ResponseDone).unwrap(),
            json!({ "type": "response_done" })
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::error(ERR_EMPTY_MESSAGE)).unwrap(),
            json!({ "type": "error", "error": "Message cannot be empty" })
        );
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_message("  hi\u{0}there\u{7}  "), "hithere");
        assert_eq!(sanitize_message("line1\nline2\tend"), "line1\nline2\tend");
        assert_eq!(sanitize_message("\u{1b}[31m"), "[31m");
        assert_eq!(sanitize_message("héllo 👋"), "héllo 👋");
    }

    #[test]
    fn test_validate_bounds() {
        assert_eq!(validate_message("", 4000), Err(MessageRejection::Empty));
        assert_eq!(validate_message("   ", 4000), Err(MessageRejection::Empty));
        assert_eq!(validate_message("\u{1}\u{2}", 4000), Err(MessageRejection::Empty));

        let max = "é".repeat(4000);
        assert_eq!(validate_message(&max, 4000).unwrap(), max);

        let over = "a".repeat(4001);
        let err = validate_message(&over, 4000).unwrap_err();
        assert_eq!(
            err.client_message(),
            "Message must be between 1 and 4000 characters"
        );
    }

    #[test]
    fn test_vendor_errors_not_forwarded() {
        assert_eq!(
            ServerMessage::from_upstream(UpstreamEvent::Error("quota".into())),
            None
        );
        assert_eq!(
            ServerMessage::from_upstream(UpstreamEvent::Unrecognized("x".into())),
            None
        );
        assert_eq!(
            ServerMessage::from_upstream(UpstreamEvent::TextDone),
            Some(ServerMessage::TextDone)
        );
    }
}
