//! Payload encoding for the storage and broadcast boundaries.
//!
//! Binary CRDT state never crosses a boundary as raw bytes:
//!
//! ```text
//! yrs state ──► base64 text ──┬──► row store column
//!                             └──► BroadcastMessage.payload
//! ```
//!
//! The WebSocket relay additionally wraps broadcasts in bincode-encoded
//! [`Frame`]s:
//!
//! ```text
//! ┌──────────┬───────────────────────────────────────────┐
//! │ variant  │ body                                      │
//! │ varint   │ Join{topic,member} | Broadcast{from,msg}… │
//! └──────────┴───────────────────────────────────────────┘
//! ```

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Encode arbitrary bytes into the text-safe payload alphabet.
#[inline]
pub fn encode_payload(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// Decode a text payload produced by [`encode_payload`].
#[inline]
pub fn decode_payload(text: &str) -> Result<Vec<u8>, CodecError> {
    STANDARD
        .decode(text)
        .map_err(|e| CodecError::Base64(e.to_string()))
}

/// The two categories of ephemeral broadcast.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BroadcastEvent {
    /// Full document state after a successful persist.
    Update,
    /// Presence delta.
    Presence,
}

impl BroadcastEvent {
    /// Event name on the channel.
    pub fn as_str(&self) -> &'static str {
        match self {
            BroadcastEvent::Update => "update",
            BroadcastEvent::Presence => "awareness",
        }
    }
}

/// A single broadcast on a named channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub event: BroadcastEvent,
    /// base64-encoded body
    pub payload: String,
}

impl BroadcastMessage {
    pub fn update(state: &[u8]) -> Self {
        Self {
            event: BroadcastEvent::Update,
            payload: encode_payload(state),
        }
    }

    pub fn presence(delta: &[u8]) -> Self {
        Self {
            event: BroadcastEvent::Presence,
            payload: encode_payload(delta),
        }
    }

    /// Decode the body back to bytes.
    pub fn decode_payload(&self) -> Result<Vec<u8>, CodecError> {
        decode_payload(&self.payload)
    }
}

/// Frames exchanged between a WebSocket channel and the relay server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    /// First frame a client sends: join a topic room.
    Join { topic: String, member: Uuid },
    /// Relay acknowledgement of a join.
    Joined { topic: String, members: usize },
    /// A broadcast, relayed to every other member of the room.
    Broadcast { from: Uuid, message: BroadcastMessage },
    /// Clean leave.
    Leave,
    Ping,
    Pong,
}

impl Frame {
    /// Serialize to binary wire format.
    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CodecError::Serialization(e.to_string()))
    }

    /// Deserialize from binary wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| CodecError::Deserialization(e.to_string()))?;
        Ok(frame)
    }
}

/// Codec errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("base64 decode error: {0}")]
    Base64(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
}
