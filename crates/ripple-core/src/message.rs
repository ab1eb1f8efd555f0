//! Chat message types.
//!
//! `Message` is the value clients create and subscribers receive.
//! `StreamEvent` is what the broker fans out: either a chat message or a
//! synthetic keepalive that exists only on the wire.

use serde::{Deserialize, Serialize};

/// A single chat message.
///
/// Immutable once created. IDs are generated client-side; the server stores
/// and relays them as-is without assigning or validating them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Client-generated identifier.
    pub id: String,
    /// Display name of the sender.
    pub sender: String,
    /// Message body.
    pub content: String,
    /// Client-side creation time, seconds since the Unix epoch.
    pub timestamp: i64,
}

/// An event delivered to stream subscribers.
///
/// Serializes straight to the wire payload: a `Message` as its JSON object,
/// a keepalive as `{"keepalive":true}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum StreamEvent {
    /// A chat message published by a client.
    Message(Message),
    /// Synthetic event keeping idle connections open.
    Keepalive {
        /// Always `true`; present so the payload is self-describing.
        keepalive: bool,
    },
}

impl StreamEvent {
    /// The keepalive event.
    #[must_use]
    pub fn keepalive() -> Self {
        Self::Keepalive { keepalive: true }
    }

    /// The chat message carried by this event, if any.
    #[must_use]
    pub fn as_message(&self) -> Option<&Message> {
        match self {
            Self::Message(msg) => Some(msg),
            Self::Keepalive { .. } => None,
        }
    }
}

impl From<Message> for StreamEvent {
    fn from(msg: Message) -> Self {
        Self::Message(msg)
    }
}
