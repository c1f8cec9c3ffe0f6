//! Versioned handshake.
//!
//! The handshake is the first frame on every link, sent by both sides. It
//! carries:
//! - Protocol version for forward compatibility
//! - Peer ID (unique identifier, also the total-order tie-break)
//! - Display name used in room events
//! - Incarnation of the process, so restarts get fresh dedup windows
//! - Role: a full peer, or a client that only issues calls

use crate::{Caller, PeerId};
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// What the sender of a handshake is.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    /// Another node; joins the broadcast group
    #[default]
    Peer,
    /// A front-end; may call the node but never receives broadcasts
    Client,
}

/// Versioned handshake message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Protocol version
    pub version: u32,
    /// Peer's unique identifier
    pub peer_id: PeerId,
    /// Player display name
    pub name: String,
    /// Process incarnation of the sender
    #[serde(default)]
    pub incarnation: u64,
    #[serde(default)]
    pub role: Role,
}

impl Handshake {
    pub fn new(peer_id: PeerId, name: impl Into<String>, incarnation: u64) -> Self {
        Self {
            msg_type: "handshake".to_string(),
            version: PROTOCOL_VERSION,
            peer_id,
            name: name.into(),
            incarnation,
            role: Role::Peer,
        }
    }

    /// Handshake for a front-end client.
    pub fn client(peer_id: PeerId, name: impl Into<String>, incarnation: u64) -> Self {
        Self {
            role: Role::Client,
            ..Self::new(peer_id, name, incarnation)
        }
    }

    /// The caller identity this peer will use for its calls.
    pub fn caller(&self) -> Caller {
        Caller::new(self.peer_id, self.incarnation)
    }

    /// Serialize to JSON bytes.
    pub fn to_json(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Handshake serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let handshake: Self = serde_json::from_slice(data).ok()?;

        // Verify it's actually a handshake
        if handshake.msg_type == "handshake" {
            Some(handshake)
        } else {
            None
        }
    }

    /// Check if we should log a version mismatch warning.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}
