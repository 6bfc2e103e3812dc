//! WAV container parsing for the local speech pipeline
//!
//! The browser player expects raw little-endian PCM16 at 24 kHz. TTS servers
//! return a WAV file, so the container is stripped here and the sample data
//! is streamed as fixed-size base64 chunks.
//!
//! Chunk sizes are read defensively: a `data` chunk whose declared size is
//! zero or runs past the end of the buffer (placeholder sizes written by
//! streaming encoders) is taken to be "everything that remains".

use base64::prelude::*;
use thiserror::Error;
use tracing::warn;

/// Raw bytes per outbound audio frame, before base64 encoding
pub const AUDIO_CHUNK_SIZE: usize = 4096;

/// Sample rates the browser player handles without audible pitch shift
const EXPECTED_SAMPLE_RATES: [u32; 2] = [24_000, 22_050];

const RIFF_HEADER_LEN: usize = 12;
const CHUNK_HEADER_LEN: usize = 8;
const MIN_FMT_LEN: usize = 16;

/// Reasons a WAV container cannot be converted
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AudioError {
    #[error("WAV data too short: {0} bytes")]
    TooShort(usize),

    #[error("Missing RIFF/WAVE header")]
    NotWav,

    #[error("fmt chunk is truncated")]
    TruncatedFormat,

    #[error("WAV has no fmt chunk")]
    MissingFormat,

    #[error("WAV has no data chunk")]
    MissingData,

    #[error("Unsupported bit depth {0}, expected 16")]
    UnsupportedBitDepth(u16),
}

/// Format fields read from the `fmt ` chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavFormat {
    pub channels: u16,
    pub sample_rate: u32,
    pub bits_per_sample: u16,
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([buf[at], buf[at + 1]])
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([buf[at], buf[at + 1], buf[at + 2], buf[at + 3]])
}

/// Parse a WAV container and return its format and PCM16 sample bytes.
///
/// The returned slice borrows from `wav` and always has an even length.
pub fn parse_wav(wav: &[u8]) -> Result<(WavFormat, &[u8]), AudioError> {
    if wav.len() < RIFF_HEADER_LEN {
        return Err(AudioError::TooShort(wav.len()));
    }
    if &wav[0..4] != b"RIFF" || &wav[8..12] != b"WAVE" {
        return Err(AudioError::NotWav);
    }

    let mut format: Option<WavFormat> = None;
    let mut data: Option<&[u8]> = None;
    let mut offset = RIFF_HEADER_LEN;

    while offset + CHUNK_HEADER_LEN <= wav.len() && (format.is_none() || data.is_none()) {
        let id = &wav[offset..offset + 4];
        let declared = read_u32(wav, offset + 4) as usize;
        let body_start = offset + CHUNK_HEADER_LEN;
        let remaining = wav.len() - body_start;

        let body_len = if id == b"data" && (declared == 0 || declared > remaining) {
            remaining
        } else {
            declared.min(remaining)
        };
        let body = &wav[body_start..body_start + body_len];

        match id {
            b"fmt " => {
                if body.len() < MIN_FMT_LEN {
                    return Err(AudioError::TruncatedFormat);
                }
                format = Some(WavFormat {
                    channels: read_u16(body, 2),
                    sample_rate: read_u32(body, 4),
                    bits_per_sample: read_u16(body, 14),
                });
            }
            b"data" => data = Some(body),
            _ => {}
        }

        // Chunks are word aligned: odd-sized bodies carry one pad byte
        offset = body_start + body_len + (body_len & 1);
    }

    let format = format.ok_or(AudioError::MissingFormat)?;
    let data = data.ok_or(AudioError::MissingData)?;

    if format.bits_per_sample != 16 {
        return Err(AudioError::UnsupportedBitDepth(format.bits_per_sample));
    }
    if !EXPECTED_SAMPLE_RATES.contains(&format.sample_rate) {
        warn!(
            sample_rate = format.sample_rate,
            "Unexpected WAV sample rate, player assumes 24000 Hz"
        );
    }
    if format.channels != 1 {
        warn!(channels = format.channels, "Unexpected WAV channel count, player assumes mono");
    }

    Ok((format, &data[..data.len() & !1]))
}

/// Strip the WAV container and return raw PCM16 little-endian samples.
pub fn extract_pcm16(wav: &[u8]) -> Result<&[u8], AudioError> {
    parse_wav(wav).map(|(_, pcm)| pcm)
}

/// Split PCM bytes into base64 frames of at most `chunk_size` raw bytes.
pub fn encode_chunks(pcm: &[u8], chunk_size: usize) -> impl Iterator<Item = String> + '_ {
    pcm.chunks(chunk_size.max(1))
        .map(|chunk| BASE64_STANDARD.encode(chunk))
}
