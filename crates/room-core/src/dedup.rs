//! At-most-once execution of remote calls.
//!
//! Each caller stamps its calls with strictly increasing sequence numbers
//! (starting at 1). The gateway keeps one window per caller: the highest
//! sequence admitted so far plus the replies of the most recent calls, so a
//! retried call gets the original reply back instead of running twice.
//!
//! Windows are bound to the caller's incarnation. A restarted caller (higher
//! incarnation) starts a fresh window; calls from an older incarnation are
//! treated as stale duplicates.

use crate::{Caller, PeerId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::oneshot;

/// Default number of replies remembered per caller.
pub const DEFAULT_WINDOW: usize = 32;

/// What to do with an incoming call.
#[derive(Debug)]
pub enum Admission<R> {
    /// First time this sequence is seen: execute, then call `complete`.
    Fresh,
    /// Already executed; this is the recorded reply.
    Replay(R),
    /// The original is still executing; resolves with its reply.
    InFlight(oneshot::Receiver<R>),
    /// Already seen but no longer remembered, or from a stale incarnation.
    /// Must not be executed.
    Duplicate,
}

enum Slot<R> {
    Running(Vec<oneshot::Sender<R>>),
    Done(R),
}

struct Window<R> {
    incarnation: u64,
    watermark: u64,
    recent: VecDeque<(u64, Slot<R>)>,
}

impl<R> Window<R> {
    fn new(incarnation: u64) -> Self {
        Self {
            incarnation,
            watermark: 0,
            recent: VecDeque::new(),
        }
    }
}

/// Per-caller duplicate suppression with reply caching.
pub struct DedupGateway<R> {
    capacity: usize,
    windows: HashMap<PeerId, Window<R>>,
}

impl<R: Clone> DedupGateway<R> {
    /// Create a gateway remembering up to `capacity` replies per caller.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            windows: HashMap::new(),
        }
    }

    /// Classify a call before executing it.
    ///
    /// A `Fresh` admission advances the caller's watermark immediately, so a
    /// concurrent retry of the same sequence waits for the original instead
    /// of executing again.
    pub fn admit(&mut self, caller: Caller, seq: u64) -> Admission<R> {
        let window = self
            .windows
            .entry(caller.peer)
            .or_insert_with(|| Window::new(caller.incarnation));

        if caller.incarnation > window.incarnation {
            *window = Window::new(caller.incarnation);
        } else if caller.incarnation < window.incarnation {
            return Admission::Duplicate;
        }

        if seq > window.watermark {
            window.watermark = seq;
            window.recent.push_back((seq, Slot::Running(Vec::new())));
            while window.recent.len() > self.capacity {
                window.recent.pop_front();
            }
            return Admission::Fresh;
        }

        match window.recent.iter_mut().find(|(s, _)| *s == seq) {
            Some((_, Slot::Done(reply))) => Admission::Replay(reply.clone()),
            Some((_, Slot::Running(waiters))) => {
                let (tx, rx) = oneshot::channel();
                waiters.push(tx);
                Admission::InFlight(rx)
            }
            None => Admission::Duplicate,
        }
    }

    /// Record the reply of a `Fresh` call and wake any retries waiting on it.
    pub fn complete(&mut self, caller: Caller, seq: u64, reply: R) {
        let Some(window) = self.windows.get_mut(&caller.peer) else {
            return;
        };
        if window.incarnation != caller.incarnation {
            return;
        }
        if let Some((_, slot)) = window.recent.iter_mut().find(|(s, _)| *s == seq) {
            if let Slot::Running(waiters) = std::mem::replace(slot, Slot::Done(reply.clone())) {
                for waiter in waiters {
                    let _ = waiter.send(reply.clone());
                }
            }
        }
    }

    /// Highest sequence admitted for a peer.
    pub fn watermark(&self, peer: &PeerId) -> Option<u64> {
        self.windows.get(peer).map(|w| w.watermark)
    }

    /// Incarnation the peer's window is bound to.
    pub fn incarnation(&self, peer: &PeerId) -> Option<u64> {
        self.windows.get(peer).map(|w| w.incarnation)
    }
}

impl<R: Clone> Default for DedupGateway<R> {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}
