//! room-daemon library: the networked pieces of a game node.
//!
//! This is a thin library layer over the daemon components,
//! allowing integration tests to drive them directly.

pub mod config;
pub mod connection;
pub mod console;
pub mod message;
pub mod outgoing;
pub mod server;

// Re-export key types for convenience
pub use config::{DaemonConfig, PeerAddress, TimingConfig};
pub use connection::{Link, WsPeerHandle};
pub use message::{Frame, MAX_MESSAGE_SIZE};
pub use outgoing::{Dialer, ReconnectConfig};
pub use server::GameServer;
