//! Wire protocol envelope types for ordered room broadcasts.
//!
//! An [`Envelope`] is the unit the broadcast orderer queues and delivers.
//! Its `content` is opaque to the orderer; the session layer reads it as a
//! [`RoomPayload`] through the typed [`RoomEvent`] conversion.
//!
//! Wire format:
//! `{"timestamp":4,"senderId":"…","senderName":"alice","type":"JOIN","content":"{…}"}`

use crate::PeerId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of a broadcast event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Join,
    Start,
    Guess,
    Leave,
    Text,
}

/// A broadcast unit, stamped by its sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Lamport timestamp assigned by the sender
    pub timestamp: u64,
    /// Sending peer
    pub sender_id: PeerId,
    /// Sender's display name
    pub sender_name: String,
    /// Event kind
    #[serde(rename = "type")]
    pub kind: EventKind,
    /// Opaque payload (a JSON-encoded [`RoomPayload`] for room events)
    pub content: String,
}

impl Envelope {
    /// Total-order key: timestamp first, sender id breaks ties.
    pub fn order_key(&self) -> (u64, PeerId) {
        (self.timestamp, self.sender_id)
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Envelope serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Acknowledgment that `acker_id` has received the envelope identified by
/// `(orig_sender_id, orig_timestamp)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ack {
    pub orig_sender_id: PeerId,
    pub orig_timestamp: u64,
    pub acker_id: PeerId,
    pub acker_timestamp: u64,
}

impl Ack {
    /// Key of the envelope being acknowledged.
    pub fn target(&self) -> (u64, PeerId) {
        (self.orig_timestamp, self.orig_sender_id)
    }
}

/// Structured content of a room event.
///
/// Only the fields relevant to the event kind are present on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomPayload {
    pub room: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capacity: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub level: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guess: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
}

impl RoomPayload {
    fn for_room(room: PeerId) -> Self {
        Self {
            room,
            capacity: None,
            level: None,
            guess: None,
            text: None,
            winner: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("Malformed room payload: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{kind:?} event is missing field `{field}`")]
    MissingField { kind: EventKind, field: &'static str },
}

/// Typed view of a room event carried by an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// The host's own join, creating the room on delivery.
    Propose {
        room: PeerId,
        capacity: usize,
        level: u32,
    },
    Join {
        room: PeerId,
    },
    Start {
        room: PeerId,
    },
    Guess {
        room: PeerId,
        guess: String,
    },
    Leave {
        room: PeerId,
    },
    /// Free text; a `winner` set by the room host ends the game.
    Say {
        room: PeerId,
        text: String,
        winner: Option<String>,
    },
}

impl RoomEvent {
    /// Room this event targets.
    pub fn room(&self) -> PeerId {
        match self {
            Self::Propose { room, .. }
            | Self::Join { room }
            | Self::Start { room }
            | Self::Guess { room, .. }
            | Self::Leave { room }
            | Self::Say { room, .. } => *room,
        }
    }

    /// Wire kind for this event.
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Propose { .. } | Self::Join { .. } => EventKind::Join,
            Self::Start { .. } => EventKind::Start,
            Self::Guess { .. } => EventKind::Guess,
            Self::Leave { .. } => EventKind::Leave,
            Self::Say { .. } => EventKind::Text,
        }
    }

    /// Encode into `(kind, content)` for an envelope.
    pub fn encode(&self) -> (EventKind, String) {
        let mut payload = RoomPayload::for_room(self.room());
        match self {
            Self::Propose {
                capacity, level, ..
            } => {
                payload.capacity = Some(*capacity);
                payload.level = Some(*level);
            }
            Self::Guess { guess, .. } => payload.guess = Some(guess.clone()),
            Self::Say { text, winner, .. } => {
                payload.text = Some(text.clone());
                payload.winner = winner.clone();
            }
            Self::Join { .. } | Self::Start { .. } | Self::Leave { .. } => {}
        }
        let content =
            serde_json::to_string(&payload).expect("RoomPayload serialization should not fail");
        (self.kind(), content)
    }

    /// Decode from an envelope's kind and content.
    pub fn decode(kind: EventKind, content: &str) -> Result<Self, PayloadError> {
        let payload: RoomPayload = serde_json::from_str(content)?;
        let room = payload.room;
        let event = match kind {
            EventKind::Join => match (payload.capacity, payload.level) {
                (Some(capacity), Some(level)) => Self::Propose {
                    room,
                    capacity,
                    level,
                },
                _ => Self::Join { room },
            },
            EventKind::Start => Self::Start { room },
            EventKind::Guess => Self::Guess {
                room,
                guess: payload.guess.ok_or(PayloadError::MissingField {
                    kind,
                    field: "guess",
                })?,
            },
            EventKind::Leave => Self::Leave { room },
            EventKind::Text => Self::Say {
                room,
                text: payload.text.ok_or(PayloadError::MissingField {
                    kind,
                    field: "text",
                })?,
                winner: payload.winner,
            },
        };
        Ok(event)
    }

    /// Decode the event carried by an envelope.
    pub fn from_envelope(envelope: &Envelope) -> Result<Self, PayloadError> {
        Self::decode(envelope.kind, &envelope.content)
    }
}
