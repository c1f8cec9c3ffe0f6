//! In-process transport.
//!
//! Nodes attached to one [`LocalNetwork`] call each other directly. Faults
//! are injected deterministically: a node can be taken down (every call to or
//! from it fails) and every call can be delivered twice with the same
//! sequence number, concurrently, to exercise duplicate suppression.

use super::{PeerHandle, Result, TransportError};
use crate::directory::DirectoryError;
use crate::node::Node;
use crate::protocol::{RemoteCall, Reply};
use crate::PeerId;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// A set of nodes living in one process.
#[derive(Default)]
pub struct LocalNetwork {
    nodes: RwLock<BTreeMap<PeerId, Weak<Node>>>,
    down: RwLock<HashSet<PeerId>>,
    duplicate_calls: AtomicBool,
}

impl LocalNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make a node reachable through this network.
    pub fn attach(&self, node: &Arc<Node>) {
        let mut nodes = self.nodes.write().unwrap_or_else(|e| e.into_inner());
        nodes.insert(node.id(), Arc::downgrade(node));
    }

    /// Handle through which `from` calls `to`.
    pub fn handle(self: &Arc<Self>, from: PeerId, to: PeerId) -> LocalHandle {
        LocalHandle {
            network: Arc::clone(self),
            from,
            to,
        }
    }

    /// Register two attached nodes with each other.
    pub fn connect(self: &Arc<Self>, a: &Arc<Node>, b: &Arc<Node>) -> std::result::Result<(), DirectoryError> {
        a.register_peer(b.id(), b.name(), Arc::new(self.handle(a.id(), b.id())))?;
        b.register_peer(a.id(), a.name(), Arc::new(self.handle(b.id(), a.id())))?;
        Ok(())
    }

    /// Form a full mesh between every attached node.
    pub fn connect_all(self: &Arc<Self>) -> std::result::Result<(), DirectoryError> {
        let nodes: Vec<Arc<Node>> = {
            let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
            nodes.values().filter_map(Weak::upgrade).collect()
        };
        for (i, a) in nodes.iter().enumerate() {
            for b in &nodes[i + 1..] {
                self.connect(a, b)?;
            }
        }
        Ok(())
    }

    /// Take a node off the network (or bring it back).
    pub fn set_down(&self, peer: PeerId, down: bool) {
        let mut set = self.down.write().unwrap_or_else(|e| e.into_inner());
        if down {
            set.insert(peer);
        } else {
            set.remove(&peer);
        }
    }

    pub fn is_down(&self, peer: &PeerId) -> bool {
        self.down
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(peer)
    }

    /// Deliver every call twice with the same sequence number.
    pub fn set_duplicate_calls(&self, enabled: bool) {
        self.duplicate_calls.store(enabled, Ordering::Relaxed);
    }

    fn node(&self, peer: &PeerId) -> Option<Arc<Node>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        nodes.get(peer).and_then(Weak::upgrade)
    }
}

/// [`PeerHandle`] for a node in the same process.
pub struct LocalHandle {
    network: Arc<LocalNetwork>,
    from: PeerId,
    to: PeerId,
}

#[async_trait]
impl PeerHandle for LocalHandle {
    async fn call(&self, call: RemoteCall) -> Result<Reply> {
        if self.network.is_down(&self.from) || self.network.is_down(&self.to) {
            return Err(TransportError::ConnectionFailed(format!(
                "{} -> {} unreachable",
                self.from, self.to
            )));
        }
        let target = self
            .network
            .node(&self.to)
            .ok_or_else(|| TransportError::PeerNotFound(self.to.to_string()))?;

        if self.network.duplicate_calls.load(Ordering::Relaxed) {
            let (_, second) =
                futures::future::join(target.handle(call.clone()), target.handle(call)).await;
            return Ok(second);
        }
        Ok(target.handle(call).await)
    }

    fn describe(&self) -> String {
        format!("local:{}", self.to)
    }
}
