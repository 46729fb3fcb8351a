//! # Frame Codec
//!
//! Defines the shapes of the messages that travel over a streaming connection
//! and validates them before anything else in the pipeline touches them.
//!
//! ## Client → Server
//! - **Binary frames**: raw audio chunks, `0 ≤ len ≤ max_chunk_bytes`
//! - **Text frames**: control messages (reserved, currently ignored)
//!
//! ## Server → Client
//! - **Welcome**: sent once, right after the session becomes active
//! - **Ack**: one per processed audio chunk
//! - **Error**: sent before a session is torn down, or when a single chunk fails
//!
//! Oversized frames are rejected, never truncated.

use actix_web::web::Bytes;
use serde::{Deserialize, Serialize};

/// Literal welcome text expected by existing clients.
pub const WELCOME_TEXT: &str = "Connection established. Send audio data as binary messages.";

/// Default maximum audio chunk size (1 MiB).
pub const DEFAULT_MAX_CHUNK_BYTES: usize = 1024 * 1024;

/// Headroom the transport allows above `max_chunk_bytes`, so a chunk that is
/// slightly too large still reaches [`FrameCodec::decode`] and gets a proper
/// `TooLarge` close instead of a transport reset.
pub const TRANSPORT_FRAME_SLACK: usize = 64 * 1024;

/// A raw message as handed over by the transport, before validation.
#[derive(Debug, Clone, PartialEq)]
pub enum RawFrame {
    Binary(Bytes),
    Text(String),
}

/// A validated frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Control message from the client (text)
    Control(String),
    /// Audio payload (binary)
    Audio(Bytes),
}

/// Why a raw frame was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("empty audio frame")]
    Empty,

    #[error("audio frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}

impl DecodeError {
    /// WebSocket close code used when a session is torn down for this error.
    pub fn close_code(&self) -> u16 {
        match self {
            DecodeError::Empty => close_code::PROTOCOL,
            DecodeError::TooLarge { .. } => close_code::TOO_BIG,
        }
    }

    /// Close reason sent alongside [`DecodeError::close_code`].
    pub fn close_reason(&self) -> &'static str {
        match self {
            DecodeError::Empty => "Protocol error",
            DecodeError::TooLarge { .. } => "Message too big",
        }
    }
}

/// WebSocket close codes (RFC 6455 §7.4.1) used by the gateway.
pub mod close_code {
    pub const NORMAL: u16 = 1000;
    pub const GOING_AWAY: u16 = 1001;
    pub const PROTOCOL: u16 = 1002;
    pub const TOO_BIG: u16 = 1009;
    pub const INTERNAL_ERROR: u16 = 1011;
}

/// How acknowledgments and other server messages are rendered.
///
/// ## Formats:
/// - **Text**: the plain strings legacy clients match on, e.g.
///   `"Received 5 bytes of audio data."`. The sequence number is the ack's
///   position in the stream.
/// - **Json**: tagged objects that carry the sequence number explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckFormat {
    #[default]
    Text,
    Json,
}

/// Messages the server writes to the client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Welcome { message: String },
    Ack { sequence: u64, bytes: usize },
    Error { message: String },
}

impl ServerMessage {
    pub fn welcome() -> Self {
        ServerMessage::Welcome {
            message: WELCOME_TEXT.to_string(),
        }
    }

    pub fn ack(sequence: u64, bytes: usize) -> Self {
        ServerMessage::Ack { sequence, bytes }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

/// Validates inbound frames and renders outbound ones.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_chunk_bytes: usize,
    allow_empty: bool,
    format: AckFormat,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CHUNK_BYTES, true, AckFormat::Text)
    }
}

impl FrameCodec {
    pub fn new(max_chunk_bytes: usize, allow_empty: bool, format: AckFormat) -> Self {
        Self {
            max_chunk_bytes,
            allow_empty,
            format,
        }
    }

    pub fn max_chunk_bytes(&self) -> usize {
        self.max_chunk_bytes
    }

    /// Turn a raw transport message into a validated [`Frame`].
    ///
    /// Binary messages become `Audio`, text messages become `Control`.
    /// Size limits only apply to audio.
    pub fn decode(&self, raw: RawFrame) -> Result<Frame, DecodeError> {
        match raw {
            RawFrame::Text(text) => Ok(Frame::Control(text)),
            RawFrame::Binary(bytes) => {
                if bytes.is_empty() && !self.allow_empty {
                    return Err(DecodeError::Empty);
                }
                if bytes.len() > self.max_chunk_bytes {
                    return Err(DecodeError::TooLarge {
                        len: bytes.len(),
                        max: self.max_chunk_bytes,
                    });
                }
                Ok(Frame::Audio(bytes))
            }
        }
    }

    /// Render a server message as the text frame sent on the wire.
    pub fn encode(&self, message: &ServerMessage) -> String {
        match self.format {
            AckFormat::Text => match message {
                ServerMessage::Welcome { message } => message.clone(),
                ServerMessage::Ack { bytes, .. } => {
                    format!("Received {} bytes of audio data.", bytes)
                }
                ServerMessage::Error { message } => format!("An error occurred: {}", message),
            },
            // Serializing a plain tagged enum cannot fail
            AckFormat::Json => serde_json::to_string(message).unwrap_or_default(),
        }
    }
}
