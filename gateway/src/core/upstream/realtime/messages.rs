//! OpenAI realtime protocol events used by the chat relay.
//!
//! Only the subset needed for text-in / audio-plus-transcript-out is modelled.
//!
//! Client events (sent to server):
//! - session.update - Persona instructions, voice, output modality
//! - conversation.item.create - Append a user text message
//! - response.create - Generate a response
//!
//! Server events (received from server), with their beta-era aliases:
//! - response.output_audio_transcript.delta (response.audio_transcript.delta)
//! - response.output_audio_transcript.done (response.audio_transcript.done)
//! - response.output_audio.delta (response.audio.delta)
//! - response.output_audio.done (response.audio.done)
//! - response.done
//! - error
//!
//! Everything else decodes to [`ServerEvent::Other`].

use serde::{Deserialize, Serialize};

use crate::core::upstream::UpstreamEvent;

// =============================================================================
// Client Events
// =============================================================================

/// Events sent to the realtime upstream
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ClientEvent {
    #[serde(rename = "session.update")]
    SessionUpdate { session: SessionConfig },

    #[serde(rename = "conversation.item.create")]
    ConversationItemCreate { item: ConversationItem },

    #[serde(rename = "response.create")]
    ResponseCreate,
}

impl ClientEvent {
    /// Build the session configuration event.
    ///
    /// No audio format is set: an explicit format was observed to distort
    /// playback in the browser, so format negotiation is left to the vendor.
    pub fn session_update(instructions: &str, voice: &str) -> Self {
        ClientEvent::SessionUpdate {
            session: SessionConfig {
                session_type: "realtime",
                instructions: instructions.to_string(),
                output_modalities: vec!["audio"],
                audio: SessionAudio {
                    output: SessionAudioOutput {
                        voice: voice.to_string(),
                    },
                },
            },
        }
    }

    pub fn user_text(text: &str) -> Self {
        ClientEvent::ConversationItemCreate {
            item: ConversationItem {
                item_type: "message",
                role: "user",
                content: vec![ContentPart::InputText {
                    text: text.to_string(),
                }],
            },
        }
    }
}

/// Session configuration payload
#[derive(Debug, Clone, Serialize)]
pub struct SessionConfig {
    #[serde(rename = "type")]
    pub session_type: &'static str,
    pub instructions: String,
    /// `audio` output includes the text transcript
    pub output_modalities: Vec<&'static str>,
    pub audio: SessionAudio,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionAudio {
    pub output: SessionAudioOutput,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionAudioOutput {
    pub voice: String,
}

/// Conversation item payload
#[derive(Debug, Clone, Serialize)]
pub struct ConversationItem {
    #[serde(rename = "type")]
    pub item_type: &'static str,
    pub role: &'static str,
    pub content: Vec<ContentPart>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ContentPart {
    #[serde(rename = "input_text")]
    InputText { text: String },
}

// =============================================================================
// Server Events
// =============================================================================

/// Events received from the realtime upstream
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum ServerEvent {
    #[serde(
        rename = "response.output_audio_transcript.delta",
        alias = "response.audio_transcript.delta"
    )]
    TranscriptDelta { delta: String },

    #[serde(
        rename = "response.output_audio_transcript.done",
        alias = "response.audio_transcript.done"
    )]
    TranscriptDone,

    #[serde(rename = "response.output_audio.delta", alias = "response.audio.delta")]
    AudioDelta { delta: String },

    #[serde(rename = "response.output_audio.done", alias = "response.audio.done")]
    AudioDone,

    #[serde(rename = "response.done")]
    ResponseDone,

    #[serde(rename = "error")]
    Error { error: ApiError },

    #[serde(other)]
    Other,
}

/// Error details carried by an `error` event
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ApiError {
    #[serde(rename = "type")]
    pub error_type: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
}

#[derive(Deserialize)]
struct EventType {
    #[serde(rename = "type")]
    kind: String,
}

/// Decode one text frame from the upstream into an [`UpstreamEvent`].
///
/// Frames that are not JSON objects with a `type` field are reported as
/// `Err` carrying the decode error.
pub fn decode_server_event(text: &str) -> Result<UpstreamEvent, serde_json::Error> {
    let event = match serde_json::from_str::<ServerEvent>(text) {
        Ok(event) => event,
        Err(e) => {
            // Known type with an unexpected shape still has a usable name
            let kind = serde_json::from_str::<EventType>(text).map_err(|_| e)?;
            return Ok(UpstreamEvent::Unrecognized(kind.kind));
        }
    };

    Ok(match event {
        ServerEvent::TranscriptDelta { delta } => UpstreamEvent::TextDelta(delta),
        ServerEvent::TranscriptDone => UpstreamEvent::TextDone,
        ServerEvent::AudioDelta { delta } => UpstreamEvent::AudioDelta(delta),
        ServerEvent::AudioDone => UpstreamEvent::AudioDone,
        ServerEvent::ResponseDone => UpstreamEvent::ResponseDone,
        ServerEvent::Error { error } => UpstreamEvent::Error(
            error
                .message
                .or(error.code)
                .or(error.error_type)
                .unwrap_or_else(|| "unknown error".to_string()),
        ),
        ServerEvent::Other => {
            let kind = serde_json::from_str::<EventType>(text)?;
            UpstreamEvent::Unrecognized(kind.kind)
        }
    })
}
