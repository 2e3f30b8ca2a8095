//! JSON wire protocol for status updates.
//!
//! Wire format (one JSON object per text frame):
//! ```text
//! {"room_id": 5, "user_id": 12, "type": "typing", "value": 1700000000}
//! ```
//!
//! `type` is one of `active`, `position`, `typing`, `ping` or `quit`.
//! A blank text frame is the legacy keepalive used by browser clients that
//! cannot send WebSocket control frames; it is echoed back untouched and never
//! parsed as JSON.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kinds of status message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Input box focused (`value != 0`) or blurred (`value == 0`)
    Active,
    /// Last message read; implies the user is active
    Position,
    /// Timestamp of the last keystroke
    Typing,
    /// Application-level keepalive
    Ping,
    /// Connection to the user was lost
    Quit,
}

impl MessageKind {
    /// Whether this kind carries user state that peers need to see.
    pub fn is_state_update(self) -> bool {
        matches!(self, Self::Active | Self::Position | Self::Typing)
    }
}

/// A single status message, used on the wire and for internal fan-out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub room_id: u64,
    #[serde(default)]
    pub user_id: u64,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub value: i64,
}

impl Message {
    pub fn new(room_id: u64, user_id: u64, kind: MessageKind, value: i64) -> Self {
        Self {
            room_id,
            user_id,
            kind,
            value,
        }
    }

    /// Create the notification sent to a room when a user leaves it.
    pub fn quit(room_id: u64, user_id: u64) -> Self {
        Self::new(room_id, user_id, MessageKind::Quit, 0)
    }

    /// Re-address the message to the given identity.
    ///
    /// Inbound frames are always attributed to the connection they arrived
    /// on, whatever ids the client put in them.
    pub fn addressed(self, room_id: u64, user_id: u64) -> Self {
        Self {
            room_id,
            user_id,
            ..self
        }
    }

    /// Serialize to a JSON text frame.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from a JSON text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// A decoded inbound text frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// Blank keepalive frame, to be echoed back verbatim
    Keepalive(String),
    /// A status message
    Message(Message),
}

impl Inbound {
    /// Classify and decode one inbound text frame.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        if text.trim().is_empty() {
            return Ok(Self::Keepalive(text.to_owned()));
        }
        Message::decode(text).map(Self::Message)
    }
}

/// Protocol errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Deserialization error: {0}")]
    Deserialization(String),
}
