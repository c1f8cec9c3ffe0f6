//! Protocol definitions for the game mesh.
//!
//! This module defines the wire protocol for peer communication:
//! - Versioned handshake for initial connection
//! - Broadcast envelopes, acknowledgments and room event payloads
//! - Remote calls and their replies

pub mod envelope;
pub mod handshake;
pub mod rpc;

pub use envelope::{Ack, Envelope, EventKind, PayloadError, RoomEvent, RoomPayload};
pub use handshake::{Handshake, Role, PROTOCOL_VERSION};
pub use rpc::{NodeStatus, PeerStatus, RemoteCall, Reply, Request};
