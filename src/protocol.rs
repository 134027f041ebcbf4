//! # Wire Protocol
//!
//! Every WebSocket text frame is a JSON object with an `eventType`
//! discriminator.
//!
//! ## Client → Server:
//! - `CONNECT { id }`: joins a logical "space" (a label, not a key)
//! - `STREAM { mediaSourceType, encodedMediaChunk }`: one base64 media chunk
//! - `REQUEST_AUDIO_STREAM_PLAYBACK {}`: stream the playback asset back
//! - `CLOSE {}`: finish the session
//!
//! ## Server → Client:
//! - `AUDIO_STREAM_PAYLOAD { audioChunk }`: one base64 chunk of raw PCM

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Media type carried by a `STREAM` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MediaSourceType {
    Audio,
    Video,
}

impl MediaSourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaSourceType::Audio => "AUDIO",
            MediaSourceType::Video => "VIDEO",
        }
    }
}

impl fmt::Display for MediaSourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events a client may send.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientEvent {
    Connect {
        id: String,
    },
    Stream {
        #[serde(rename = "mediaSourceType")]
        media_source_type: MediaSourceType,
        #[serde(rename = "encodedMediaChunk")]
        encoded_media_chunk: String,
    },
    RequestAudioStreamPlayback,
    Close,
}

const KNOWN_EVENT_TYPES: [&str; 4] = ["CONNECT", "STREAM", "REQUEST_AUDIO_STREAM_PLAYBACK", "CLOSE"];

/// Events the server sends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServerEvent {
    AudioStreamPayload {
        #[serde(rename = "audioChunk")]
        audio_chunk: String,
    },
}

impl ServerEvent {
    /// Wrap raw PCM bytes as an `AUDIO_STREAM_PAYLOAD`.
    pub fn audio_payload(chunk: &[u8]) -> Self {
        ServerEvent::AudioStreamPayload {
            audio_chunk: BASE64.encode(chunk),
        }
    }
}

/// Result of parsing one inbound frame that was at least well-formed JSON
/// with an `eventType`.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Event(ClientEvent),
    /// Well-formed, but the discriminator is not one we handle
    Unrecognized(String),
}

/// Why an inbound frame could not be understood.
#[derive(Debug)]
pub enum ProtocolError {
    /// Not JSON, or no string `eventType`
    Malformed(String),
    /// Known `eventType` with missing or invalid fields
    InvalidEvent { event_type: String, reason: String },
    /// `encodedMediaChunk` is not valid base64
    InvalidChunk(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Malformed(msg) => write!(f, "malformed message: {}", msg),
            ProtocolError::InvalidEvent { event_type, reason } => {
                write!(f, "invalid {} event: {}", event_type, reason)
            }
            ProtocolError::InvalidChunk(msg) => write!(f, "invalid media chunk: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "eventType")]
    event_type: String,
}

/// Parse one inbound text frame.
///
/// Unknown discriminators are reported separately from malformed payloads so
/// the caller can log them at a lower severity.
pub fn parse_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let envelope: Envelope =
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    if !KNOWN_EVENT_TYPES.contains(&envelope.event_type.as_str()) {
        return Ok(Inbound::Unrecognized(envelope.event_type));
    }

    serde_json::from_str::<ClientEvent>(text)
        .map(Inbound::Event)
        .map_err(|e| ProtocolError::InvalidEvent {
            event_type: envelope.event_type,
            reason: e.to_string(),
        })
}

/// Decode the base64 payload of a `STREAM` event.
pub fn decode_chunk(encoded: &str) -> Result<Vec<u8>, ProtocolError> {
    BASE64
        .decode(encoded.trim())
        .map_err(|e| ProtocolError::InvalidChunk(e.to_string()))
}
