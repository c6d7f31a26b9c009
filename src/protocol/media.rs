//! Media-plane (sendspin) message types
//!
//! JSON control records use a `{type, payload}` envelope. Audio arrives as
//! binary frames: one kind byte, an 8-byte big-endian server timestamp in
//! microseconds, then the encoded audio.

use crate::error::SessionError;
use bytes::{Buf, Bytes};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Binary frame kind carrying an audio chunk
pub const AUDIO_CHUNK_KIND: u8 = 4;

/// Kind byte plus timestamp
pub const BINARY_HEADER_LEN: usize = 9;

/// Protocol revision announced in `client/hello`
pub const MEDIA_PROTOCOL_VERSION: u32 = 1;

/// One audio format the client can decode
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AudioFormat {
    pub codec: String,
    pub channels: u8,
    pub sample_rate: u32,
    pub bit_depth: u8,
}

impl AudioFormat {
    pub fn pcm(sample_rate: u32, bit_depth: u8) -> Self {
        Self {
            codec: "pcm".to_string(),
            channels: 2,
            sample_rate,
            bit_depth,
        }
    }
}

/// Player role capabilities declared at bootstrap
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PlayerSupport {
    pub support_formats: Vec<AudioFormat>,
    /// Bytes of encoded audio the client can buffer ahead
    pub buffer_capacity: u64,
}

/// Client identity and capabilities
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientHello {
    pub client_id: String,
    pub name: String,
    pub version: u32,
    pub supported_roles: Vec<String>,
    pub player_support: PlayerSupport,
}

impl ClientHello {
    pub fn player(
        client_id: impl Into<String>,
        name: impl Into<String>,
        formats: Vec<AudioFormat>,
        buffer_capacity: u64,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            name: name.into(),
            version: MEDIA_PROTOCOL_VERSION,
            supported_roles: vec!["player".to_string()],
            player_support: PlayerSupport {
                support_formats: formats,
                buffer_capacity,
            },
        }
    }
}

/// Server confirmation that the media session is live
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MediaServerHello {
    pub server_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: u32,
}

/// Format of the stream the server is about to send
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StreamFormat {
    #[serde(flatten)]
    pub format: AudioFormat,
    /// Base64 codec header for codecs that need one (flac, opus)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec_header: Option<String>,
}

/// `{type, payload}` envelope used by every JSON media frame
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MediaEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl MediaEnvelope {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }

    pub fn client_hello(hello: &ClientHello) -> Result<Self, SessionError> {
        Ok(Self::new("client/hello", serde_json::to_value(hello)?))
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Event delivered to media-plane subscribers
#[derive(Debug, Clone, PartialEq)]
pub enum MediaEvent {
    Connected(MediaServerHello),
    StreamStart(StreamFormat),
    StreamEnd,
    AudioChunk { timestamp_us: i64, data: Bytes },
    Error { message: String },
}

/// Inbound JSON media frame after classification
#[derive(Debug, Clone, PartialEq)]
pub enum MediaMessage {
    ServerHello(MediaServerHello),
    StreamStart(StreamFormat),
    StreamEnd,
    Error(String),
    /// Known envelope, type this client does not act on
    Unhandled(String),
}

impl MediaMessage {
    pub fn parse(text: &str) -> Result<Self, SessionError> {
        let envelope: MediaEnvelope = serde_json::from_str(text)?;
        let message = match envelope.kind.as_str() {
            "server/hello" => MediaMessage::ServerHello(decode_payload(&envelope)?),
            "stream/start" => {
                let player = envelope
                    .payload
                    .get("player")
                    .cloned()
                    .ok_or_else(|| SessionError::protocol("stream/start without player format"))?;
                MediaMessage::StreamStart(serde_json::from_value(player).map_err(|e| {
                    SessionError::protocol(format!("malformed stream/start: {e}"))
                })?)
            }
            "stream/end" => MediaMessage::StreamEnd,
            "error" => MediaMessage::Error(
                envelope
                    .payload
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown error")
                    .to_string(),
            ),
            _ => MediaMessage::Unhandled(envelope.kind),
        };
        Ok(message)
    }
}

fn decode_payload<T: serde::de::DeserializeOwned>(
    envelope: &MediaEnvelope,
) -> Result<T, SessionError> {
    serde_json::from_value(envelope.payload.clone())
        .map_err(|e| SessionError::protocol(format!("malformed {}: {e}", envelope.kind)))
}

/// Decode a binary audio frame
pub fn parse_audio_chunk(mut frame: Bytes) -> Result<(i64, Bytes), SessionError> {
    if frame.len() < BINARY_HEADER_LEN {
        return Err(SessionError::protocol(format!(
            "binary frame too short: {} bytes",
            frame.len()
        )));
    }
    let kind = frame.get_u8();
    if kind != AUDIO_CHUNK_KIND {
        return Err(SessionError::protocol(format!(
            "unknown binary frame kind {kind}"
        )));
    }
    let timestamp_us = frame.get_i64();
    Ok((timestamp_us, frame))
}
