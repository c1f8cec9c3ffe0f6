//! Link frames.
//!
//! After the handshake every WebSocket message is one UTF-8 JSON frame sent
//! as a binary WebSocket message: either a remote call or the reply to one.

use room_core::{RemoteCall, Reply};
use serde::{Deserialize, Serialize};

/// Maximum frame size (1MB); room traffic is small.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "camelCase")]
pub enum Frame {
    /// A call for the receiving node
    Call(RemoteCall),
    /// Answer to the call the receiver sent with `seq`
    Reply { seq: u64, reply: Reply },
}

impl Frame {
    /// Serialize to UTF-8 JSON bytes.
    pub fn to_binary(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("Frame serialization should not fail")
    }

    /// Try to parse a frame. Returns None for anything that is not one.
    pub fn from_binary(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}
