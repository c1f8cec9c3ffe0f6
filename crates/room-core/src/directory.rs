//! Peer directory: who this node can reach and how.
//!
//! Each registered peer gets a [`PeerRef`] holding its display name, the
//! transport handle used to call it, and the sending half of its FIFO outbox.
//! The node drives the outbox; the directory only hands out the receiver when
//! a peer is first registered.
//!
//! Readers always see a consistent snapshot: registration and removal each
//! happen under one write lock.

use crate::protocol::Request;
use crate::transport::PeerHandle;
use crate::PeerId;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors that can occur during peer registration.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Peer name cannot be empty")]
    EmptyName,
    #[error("Cannot register the local node {0} as a peer")]
    SelfRegistration(PeerId),
}

/// Addressing information for one peer.
#[derive(Clone)]
pub struct PeerRef {
    pub id: PeerId,
    pub name: String,
    pub handle: Arc<dyn PeerHandle>,
    outbox: mpsc::UnboundedSender<Request>,
}

impl PeerRef {
    /// Queue a request on this peer's outbox.
    ///
    /// Returns false if the outbox has shut down.
    pub fn post(&self, request: Request) -> bool {
        self.outbox.send(request).is_ok()
    }
}

impl fmt::Debug for PeerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerRef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("handle", &self.handle.describe())
            .finish()
    }
}

/// Outcome of a registration.
pub enum Registered {
    /// First registration; drive this receiver to deliver the peer's outbox
    New(mpsc::UnboundedReceiver<Request>),
    /// Peer was already known; its handle and name were replaced
    Updated,
}

/// Registry of reachable peers, excluding the local node.
pub struct PeerDirectory {
    local: PeerId,
    peers: RwLock<BTreeMap<PeerId, PeerRef>>,
}

impl PeerDirectory {
    pub fn new(local: PeerId) -> Self {
        Self {
            local,
            peers: RwLock::new(BTreeMap::new()),
        }
    }

    /// Add a peer, or refresh the handle of a known one (reconnect).
    pub fn register(
        &self,
        id: PeerId,
        name: &str,
        handle: Arc<dyn PeerHandle>,
    ) -> Result<Registered, DirectoryError> {
        if name.trim().is_empty() {
            return Err(DirectoryError::EmptyName);
        }
        if id == self.local {
            return Err(DirectoryError::SelfRegistration(id));
        }

        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = peers.get_mut(&id) {
            existing.name = name.to_string();
            existing.handle = handle;
            return Ok(Registered::Updated);
        }

        let (outbox, rx) = mpsc::unbounded_channel();
        peers.insert(
            id,
            PeerRef {
                id,
                name: name.to_string(),
                handle,
                outbox,
            },
        );
        Ok(Registered::New(rx))
    }

    /// Forget a peer. Dropping the returned ref closes its outbox once the
    /// queued requests are drained.
    pub fn remove(&self, id: &PeerId) -> Option<PeerRef> {
        self.peers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<PeerRef> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn name_of(&self, id: &PeerId) -> Option<String> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .map(|p| p.name.clone())
    }

    /// All peers, ordered by id.
    pub fn snapshot(&self) -> Vec<PeerRef> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<PeerId> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .copied()
            .collect()
    }

    /// Queue a request on every peer's outbox. Returns how many accepted it.
    pub fn post_all(&self, request: &Request) -> usize {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|peer| peer.post(request.clone()))
            .count()
    }

    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
