//! Event infrastructure for observing a node.
//!
//! Provides `MeshEvent` for consoles and monitoring, and `EventBus` for
//! subscriptions. Callbacks run synchronously on the emitting task, so they
//! must not block.

use crate::protocol::EventKind;
use crate::session::Transition;
use crate::PeerId;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock, Weak};

/// Events emitted by a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum MeshEvent {
    /// A broadcast left the hold-back queue.
    Delivered {
        timestamp: u64,
        #[serde(rename = "senderId")]
        sender_id: PeerId,
        #[serde(rename = "senderName")]
        sender_name: String,
        kind: EventKind,
    },
    /// A room replica changed.
    Room { transition: Transition },
    /// A delivered event was refused by the room replica.
    Refused {
        #[serde(rename = "senderName")]
        sender_name: String,
        reason: String,
    },
    /// A peer was added to the directory.
    PeerJoined {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
        name: String,
    },
    /// A peer went quiet past the tolerance.
    PeerSuspected {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A suspected peer was heard from again.
    PeerRecovered {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
    /// A peer was declared failed and evicted.
    PeerFailed {
        #[serde(rename = "peerId")]
        peer_id: PeerId,
    },
}

/// Subscription handle that unsubscribes automatically when dropped.
///
/// Follows the disposer pattern: hold this value to keep receiving events,
/// drop it (or let it go out of scope) to unsubscribe.
pub struct Subscription {
    bus: Weak<EventBus>,
    id: usize,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(bus) = self.bus.upgrade() {
            bus.unsubscribe(self.id);
        }
    }
}

type Callback = Arc<dyn Fn(MeshEvent) + Send + Sync>;

/// Event bus for publishing node events to subscribers.
///
/// Wrap in `Arc` to enable subscriptions.
#[derive(Default)]
pub struct EventBus {
    callbacks: RwLock<Vec<(usize, Callback)>>,
    next_id: AtomicUsize,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to events. Returns `Subscription` that unsubscribes on drop.
    pub fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(MeshEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(callback)));
        Subscription {
            bus: Arc::downgrade(self),
            id,
        }
    }

    fn unsubscribe(&self, id: usize) {
        // try_write: Drop may run during unwinding while emit holds a read lock
        if let Ok(mut guard) = self.callbacks.try_write() {
            guard.retain(|(i, _)| *i != id);
        }
    }

    /// Emit an event to all subscribers.
    pub fn emit(&self, event: MeshEvent) {
        // Clone the list so a callback may subscribe without deadlocking
        let callbacks: Vec<Callback> = self
            .callbacks
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, cb)| Arc::clone(cb))
            .collect();

        for callback in callbacks {
            callback(event.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.callbacks.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn suspected(n: u64) -> MeshEvent {
        MeshEvent::PeerSuspected {
            peer_id: PeerId::from(n),
        }
    }

    #[test]
    fn test_subscriber_receives_events() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = bus.subscribe(move |e| sink.lock().unwrap().push(e));

        bus.emit(suspected(1));
        bus.emit(suspected(2));
        assert_eq!(*seen.lock().unwrap(), vec![suspected(1), suspected(2)]);
    }

    #[test]
    fn test_drop_unsubscribes() {
        let bus = Arc::new(EventBus::new());
        let sub = bus.subscribe(|_| {});
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_callback_may_subscribe() {
        let bus = Arc::new(EventBus::new());
        let inner_bus = Arc::clone(&bus);
        let held = Arc::new(Mutex::new(Vec::new()));
        let holder = Arc::clone(&held);
        let _sub = bus.subscribe(move |_| {
            holder.lock().unwrap().push(inner_bus.subscribe(|_| {}));
        });
        bus.emit(suspected(1));
        assert_eq!(bus.subscriber_count(), 2);
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_string(&MeshEvent::PeerFailed {
            peer_id: PeerId::from(0x2a),
        })
        .unwrap();
        assert_eq!(json, r#"{"type":"peerFailed","peerId":"000000000000002a"}"#);
    }
}
