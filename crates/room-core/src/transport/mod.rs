//! Transport abstraction for reaching other nodes.
//!
//! Implementations:
//! - In-process: [`LocalNetwork`] wires nodes of one process together (tests,
//!   simulations) with fault injection
//! - WebSocket: provided by the daemon

use crate::protocol::{RemoteCall, Reply};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

mod local;

pub use local::{LocalHandle, LocalNetwork};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("No reply within {0:?}")]
    Timeout(Duration),

    #[error("Link closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// A callable reference to one remote node.
///
/// A call either yields the remote node's reply or a transport error. An
/// error is ambiguous: the call may or may not have executed, so callers
/// retry with the same sequence number.
#[async_trait]
pub trait PeerHandle: Send + Sync {
    /// Invoke a remote call and wait for its reply.
    async fn call(&self, call: RemoteCall) -> Result<Reply>;

    /// Human-readable description of the link, for logs.
    fn describe(&self) -> String;
}
