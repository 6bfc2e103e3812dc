//! Local speech pipeline: streaming chat completion, then text-to-speech.
//!
//! Both endpoints are OpenAI compatible:
//!
//! - `POST {llm_url}/v1/chat/completions` with `stream: true`, answered as
//!   server-sent events (`data: {...}` lines, terminated by `data: [DONE]`)
//! - `POST {tts_url}/v1/audio/speech` with `response_format: "wav"`
//!
//! Text deltas are yielded the moment each SSE event arrives. Audio is only
//! available once the whole reply has been synthesized, and is then streamed
//! as base64 PCM16 frames.

use std::sync::Arc;
use std::time::Duration;

use async_stream::try_stream;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{UpstreamError, UpstreamEvent, UpstreamResult};
use crate::config::ServerConfig;
use crate::core::audio::{AUDIO_CHUNK_SIZE, encode_chunks, extract_pcm16};

/// Longest slice of an upstream error body written to the log
const MAX_LOGGED_BODY: usize = 512;

// =============================================================================
// Wire types
// =============================================================================

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatCompletionChunk {
    choices: Vec<ChunkChoice>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkChoice {
    delta: ChunkDelta,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Debug, Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'static str,
    speed: f32,
}

// =============================================================================
// SSE decoding
// =============================================================================

/// Splits a byte stream into SSE `data:` payloads
#[derive(Debug, Default)]
struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    /// Feed bytes, returning the payload of every complete `data:` line.
    fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = data_payload(&line) {
                payloads.push(data);
            }
        }
        payloads
    }

    /// Payload of a trailing line that arrived without a newline.
    fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        data_payload(&line)
    }
}

fn data_payload(line: &[u8]) -> Option<String> {
    let line = String::from_utf8_lossy(line);
    let line = line.trim();
    line.strip_prefix("data:")
        .map(|data| data.trim_start().to_string())
}

enum SseData {
    Done,
    Delta(String),
    Nothing,
}

fn parse_sse_data(data: &str) -> SseData {
    if data == "[DONE]" {
        return SseData::Done;
    }
    match serde_json::from_str::<ChatCompletionChunk>(data) {
        Ok(chunk) => match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
            Some(content) if !content.is_empty() => SseData::Delta(content),
            _ => SseData::Nothing,
        },
        Err(e) => {
            warn!("Failed to parse completion chunk: {}", e);
            SseData::Nothing
        }
    }
}

fn truncate_for_log(body: &str) -> &str {
    match body.char_indices().nth(MAX_LOGGED_BODY) {
        Some((idx, _)) => &body[..idx],
        None => body,
    }
}

// =============================================================================
// Pipeline
// =============================================================================

/// Items produced by [`LocalPipeline::stream_completion`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionEvent {
    Delta(String),
    /// Concatenation of every delta, emitted once at the end
    Finished(String),
}

/// Chat completion + TTS backend. Cheap to clone.
#[derive(Debug, Clone)]
pub struct LocalPipeline {
    client: reqwest::Client,
    system_prompt: Arc<str>,
    llm_url: String,
    llm_model: String,
    tts_url: String,
    tts_model: String,
    voice: String,
    speed: f32,
    timeout: Duration,
}

impl LocalPipeline {
    pub fn new(config: &ServerConfig, client: reqwest::Client) -> Self {
        info!(
            llm = %config.local_llm_url,
            tts = %config.tts_url,
            voice = %config.tts_voice,
            speed = config.tts_speed,
            "Local pipeline initialized"
        );

        Self {
            client,
            system_prompt: Arc::from(config.system_prompt.as_str()),
            llm_url: config.local_llm_url.trim_end_matches('/').to_string(),
            llm_model: config.local_llm_model.clone(),
            tts_url: config.tts_url.trim_end_matches('/').to_string(),
            tts_model: config.tts_model.clone(),
            voice: config.tts_voice.clone(),
            speed: config.tts_speed,
            timeout: config.upstream_timeout(),
        }
    }

    /// Stream a chat completion for `user_text`.
    ///
    /// Yields [`CompletionEvent::Delta`] for each SSE event as it arrives and
    /// finally [`CompletionEvent::Finished`] with the full text. Dropping the
    /// stream cancels the request.
    pub fn stream_completion(
        &self,
        system_prompt: &str,
        user_text: &str,
    ) -> impl Stream<Item = UpstreamResult<CompletionEvent>> + Send + 'static {
        let url = format!("{}/v1/chat/completions", self.llm_url);
        let request = self.client.post(&url).timeout(self.timeout).json(&ChatCompletionRequest {
            model: &self.llm_model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user_text,
                },
            ],
            stream: true,
        });

        try_stream! {
            debug!(url = %url, "Calling local LLM");
            let response = request
                .send()
                .await
                .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(status = status.as_u16(), body = %truncate_for_log(&body), "LLM returned error status");
                Err(UpstreamError::BadStatus(status.as_u16()))?;
                return;
            }

            let mut body = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            let mut full = String::new();
            let mut finished = false;

            while !finished {
                let Some(chunk) = body.next().await else {
                    break;
                };
                let chunk = chunk.map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

                for data in decoder.push(&chunk) {
                    match parse_sse_data(&data) {
                        SseData::Done => {
                            finished = true;
                            break;
                        }
                        SseData::Delta(text) => {
                            full.push_str(&text);
                            yield CompletionEvent::Delta(text);
                        }
                        SseData::Nothing => {}
                    }
                }
            }

            if !finished && let Some(data) = decoder.finish() && let SseData::Delta(text) = parse_sse_data(&data) {
                full.push_str(&text);
                yield CompletionEvent::Delta(text);
            }

            info!(chars = full.chars().count(), "LLM response complete");
            yield CompletionEvent::Finished(full);
        }
    }

    /// Synthesize `text` and return the WAV body.
    pub async fn synthesize_speech(&self, text: &str, voice: &str, speed: f32) -> UpstreamResult<Bytes> {
        let url = format!("{}/v1/audio/speech", self.tts_url);
        debug!(url = %url, chars = text.chars().count(), "Calling TTS");

        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&SpeechRequest {
                model: &self.tts_model,
                input: text,
                voice,
                response_format: "wav",
                speed,
            })
            .send()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), body = %truncate_for_log(&body), "TTS returned error status");
            return Err(UpstreamError::BadStatus(status.as_u16()));
        }

        let wav = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Unavailable(e.to_string()))?;
        debug!(bytes = wav.len(), "TTS audio received");
        Ok(wav)
    }

    /// Convert WAV bytes into base64 PCM16 frames of [`AUDIO_CHUNK_SIZE`] raw bytes.
    pub fn stream_audio(wav: &[u8]) -> UpstreamResult<impl Iterator<Item = String> + '_> {
        let pcm = extract_pcm16(wav)?;
        Ok(encode_chunks(pcm, AUDIO_CHUNK_SIZE))
    }

    /// Run one full exchange for `user_text`.
    ///
    /// Yields `TextDelta*, TextDone, AudioDelta*, AudioDone, ResponseDone`
    /// in that order, or stops with the error of whichever stage failed.
    pub fn run_exchange(
        &self,
        user_text: String,
    ) -> impl Stream<Item = UpstreamResult<UpstreamEvent>> + Send + 'static {
        let this = self.clone();

        try_stream! {
            let completion = this.stream_completion(&this.system_prompt, &user_text);
            futures::pin_mut!(completion);

            let mut full_text = String::new();
            while let Some(event) = completion.next().await {
                match event? {
                    CompletionEvent::Delta(text) => {
                        yield UpstreamEvent::TextDelta(text);
                    }
                    CompletionEvent::Finished(text) => full_text = text,
                }
            }
            yield UpstreamEvent::TextDone;

            if full_text.trim().is_empty() {
                warn!("LLM produced no text, skipping speech synthesis");
            } else {
                let wav = this.synthesize_speech(&full_text, &this.voice, this.speed).await?;
                for chunk in LocalPipeline::stream_audio(&wav)? {
                    yield UpstreamEvent::AudioDelta(chunk);
                }
            }

            yield UpstreamEvent::AudioDone;
            yield UpstreamEvent::ResponseDone;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sse_decoder_handles_split_lines() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        let out = decoder.push(b":1}\r\n\r\nevent: ping\ndata: [DONE]\n");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "[DONE]".to_string()]);
        assert!(decoder.finish().is_none());
    }

    #[test]
    fn test_sse_decoder_trailing_line() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data:[DONE]").is_empty());
        assert_eq!(decoder.finish().as_deref(), Some("[DONE]"));
    }

    #[test]
    fn test_sse_decoder_keeps_multibyte_chars() {
        let mut decoder = SseDecoder::default();
        let line = "data: héllo\n".as_bytes();
        let (a, b) = line.split_at(8); // splits inside 'é'
        assert!(decoder.push(a).is_empty());
        assert_eq!(decoder.push(b), vec!["héllo".to_string()]);
    }

    #[test]
    fn test_parse_sse_data() {
        assert!(matches!(parse_sse_data("[DONE]"), SseData::Done));
        assert!(matches!(
            parse_sse_data(r#"{"choices":[{"delta":{"content":"Hi"}}]}"#),
            SseData::Delta(ref s) if s == "Hi"
        ));
        assert!(matches!(
            parse_sse_data(r#"{"choices":[{"delta":{"role":"assistant"}}]}"#),
            SseData::Nothing
        ));
        assert!(matches!(parse_sse_data(r#"{"choices":[]}"#), SseData::Nothing));
        assert!(matches!(parse_sse_data("{oops"), SseData::Nothing));
    }

    #[test]
    fn test_truncate_for_log() {
        let long = "x".repeat(MAX_LOGGED_BODY + 10);
        assert_eq!(truncate_for_log(&long).len(), MAX_LOGGED_BODY);
        assert_eq!(truncate_for_log("short"), "short");
    }

    #[test]
    fn test_stream_audio_rejects_garbage() {
        assert!(matches!(
            LocalPipeline::stream_audio(b"definitely not a wav"),
            Err(UpstreamError::Audio(_))
        ));
    }
}
