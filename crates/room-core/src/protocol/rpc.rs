//! Remote call boundary.
//!
//! Everything a node can be asked to do travels as a [`RemoteCall`]: the
//! caller's identity, its sequence number for duplicate suppression, and the
//! [`Request`] itself. Every call yields exactly one [`Reply`].

use super::envelope::{Ack, Envelope};
use crate::failure::PeerState;
use crate::session::{GameRoom, RoomId};
use crate::{Caller, PeerId};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Request {
    // Peer protocol
    Deliver { envelope: Envelope },
    Acknowledge { ack: Ack },
    Ping,

    // Player operations on the receiving node
    Propose { capacity: usize, level: u32 },
    Join { room: RoomId },
    Leave { room: RoomId },
    Guess { room: RoomId, guess: String },
    Say { room: RoomId, text: String },
    Status,
}

impl Request {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Deliver { .. } => "deliver",
            Self::Acknowledge { .. } => "acknowledge",
            Self::Ping => "ping",
            Self::Propose { .. } => "propose",
            Self::Join { .. } => "join",
            Self::Leave { .. } => "leave",
            Self::Guess { .. } => "guess",
            Self::Say { .. } => "say",
            Self::Status => "status",
        }
    }
}

/// A request stamped with the caller's identity and sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteCall {
    pub caller: Caller,
    pub seq: u64,
    pub request: Request,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Reply {
    Accepted,
    Pong,
    Proposed { room: RoomId, timestamp: u64 },
    Joined { room: RoomId, timestamp: u64 },
    Left { room: RoomId, timestamp: u64 },
    GuessSubmitted { room: RoomId, timestamp: u64 },
    Said { room: RoomId, timestamp: u64 },
    Status { status: NodeStatus },
    /// The operation was refused; nothing changed
    Rejected { reason: String },
    /// Already handled and no longer remembered
    Duplicate { seq: u64 },
    /// Broadcast but not delivered in time; it may still deliver later
    TimedOut { timestamp: u64 },
}

impl Reply {
    pub fn rejected(reason: impl ToString) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerStatus {
    pub id: PeerId,
    pub name: String,
    /// `None` once the failure monitor stopped tracking it
    pub state: Option<PeerState>,
}

/// Snapshot of a node for status displays.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub node_id: PeerId,
    pub name: String,
    pub clock: u64,
    pub peers: Vec<PeerStatus>,
    pub pending_messages: usize,
    pub rooms: Vec<GameRoom>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_wire_format() {
        let call = RemoteCall {
            caller: Caller::new(PeerId::from(1), 9),
            seq: 5,
            request: Request::Guess {
                room: PeerId::from(2),
                guess: "lantern".into(),
            },
        };
        let json = serde_json::to_string(&call).unwrap();
        assert!(json.contains("\"seq\":5"));
        assert!(json.contains("\"type\":\"guess\""));
        assert!(json.contains("\"guess\":\"lantern\""));

        let parsed: RemoteCall = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, call);
    }

    #[test]
    fn test_unit_request_wire_format() {
        let json = serde_json::to_string(&Request::Ping).unwrap();
        assert_eq!(json, r#"{"type":"ping"}"#);
    }

    #[test]
    fn test_reply_wire_format() {
        let json = serde_json::to_string(&Reply::GuessSubmitted {
            room: PeerId::from(2),
            timestamp: 12,
        })
        .unwrap();
        assert!(json.contains("\"type\":\"guessSubmitted\""));

        let rejected = Reply::rejected("Room is full");
        assert!(rejected.is_rejected());
        assert_eq!(
            serde_json::to_string(&rejected).unwrap(),
            r#"{"type":"rejected","reason":"Room is full"}"#
        );
    }

    #[test]
    fn test_request_names() {
        assert_eq!(Request::Status.name(), "status");
        assert_eq!(Request::Leave { room: PeerId::from(1) }.name(), "leave");
    }
}
