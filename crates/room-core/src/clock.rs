//! Lamport logical clock.
//!
//! One scalar per node. Every local event ticks it; every received timestamp
//! pulls it forward past the remote value, so timestamps respect
//! happened-before across the mesh.

use std::sync::atomic::{AtomicU64, Ordering};

/// A monotonically advancing Lamport clock.
///
/// All operations are single atomic read-modify-write steps, so concurrent
/// inbound calls on the same node never observe or produce a torn value.
#[derive(Debug, Default)]
pub struct LogicalClock {
    value: AtomicU64,
}

impl LogicalClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance for a local event (including a send) and return the new value.
    pub fn tick(&self) -> u64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Merge a remote timestamp: `max(local, remote) + 1`.
    pub fn observe(&self, remote: u64) -> u64 {
        let previous = self
            .value
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |local| {
                Some(local.max(remote) + 1)
            })
            .unwrap_or_else(|current| current);
        previous.max(remote) + 1
    }

    /// Current value without advancing.
    pub fn now(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }
}
