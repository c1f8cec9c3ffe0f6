//! Failure detection by inactivity.
//!
//! Every tracked peer moves through a small state machine driven by a
//! periodic sweep:
//! 1. Any valid call from the peer resets it to `Alive`
//! 2. No activity for `tolerance` → `Suspected`
//! 3. `x_factor` further sweeps still inactive → `Failed`, dropped from tracking
//!
//! The monitor only reports transitions; the caller acts on `PeerFailed`
//! (evicting the peer from rooms and releasing its pending acknowledgments).

use crate::PeerId;
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Configuration for failure detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    /// Inactivity allowed before a peer is suspected (default: 3s)
    pub tolerance: Duration,
    /// How often the sweep runs; must not exceed `tolerance` (default: 1s)
    pub check_interval: Duration,
    /// Sweeps a suspected peer survives before it is declared failed (default: 3)
    pub x_factor: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            tolerance: Duration::from_secs(3),
            check_interval: Duration::from_secs(1),
            x_factor: 3,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum MonitorConfigError {
    #[error("check interval {interval:?} exceeds tolerance {tolerance:?}")]
    IntervalExceedsTolerance {
        interval: Duration,
        tolerance: Duration,
    },
    #[error("check interval must be non-zero")]
    ZeroInterval,
    #[error("x factor must be at least 1")]
    ZeroFactor,
}

impl MonitorConfig {
    pub fn validate(&self) -> Result<(), MonitorConfigError> {
        if self.check_interval.is_zero() {
            return Err(MonitorConfigError::ZeroInterval);
        }
        if self.check_interval > self.tolerance {
            return Err(MonitorConfigError::IntervalExceedsTolerance {
                interval: self.check_interval,
                tolerance: self.tolerance,
            });
        }
        if self.x_factor == 0 {
            return Err(MonitorConfigError::ZeroFactor);
        }
        Ok(())
    }
}

/// Liveness state of a tracked peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerState {
    Alive,
    Suspected,
    Failed,
}

/// Tracking record for one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub peer_id: PeerId,
    /// Last valid call observed (ms since epoch)
    pub last_interaction: u64,
    pub state: PeerState,
    /// Sweeps survived while suspected
    pub suspect_count: u32,
}

/// Event emitted by the failure monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureEvent {
    /// Peer has been silent longer than the tolerance
    PeerSuspected { peer_id: PeerId },
    /// Suspected peer showed activity again
    PeerRecovered { peer_id: PeerId },
    /// Peer stayed silent through `x_factor` more sweeps; no longer tracked
    PeerFailed { peer_id: PeerId },
}

/// Inactivity-based failure monitor.
///
/// The caller is responsible for:
/// - Calling `sweep()` every `check_interval`
/// - Calling `update_activity()` for each non-duplicate call
/// - Acting on emitted events
pub struct FailureMonitor {
    config: MonitorConfig,
    records: HashMap<PeerId, FailureRecord>,
}

impl FailureMonitor {
    /// Create a monitor, rejecting inconsistent timing.
    pub fn new(config: MonitorConfig) -> Result<Self, MonitorConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            records: HashMap::new(),
        })
    }

    pub fn config(&self) -> &MonitorConfig {
        &self.config
    }

    /// Start tracking a peer as alive.
    ///
    /// Returns false if the peer was already tracked (its record is refreshed).
    pub fn register_client(&mut self, peer_id: PeerId, now_ms: u64) -> bool {
        let fresh = !self.records.contains_key(&peer_id);
        self.records.insert(
            peer_id,
            FailureRecord {
                peer_id,
                last_interaction: now_ms,
                state: PeerState::Alive,
                suspect_count: 0,
            },
        );
        fresh
    }

    /// Stop tracking a peer.
    pub fn unregister_client(&mut self, peer_id: &PeerId) -> Option<FailureRecord> {
        self.records.remove(peer_id)
    }

    /// Record a valid call from a peer.
    ///
    /// Returns `PeerRecovered` if the peer was suspected. Untracked peers are ignored.
    pub fn update_activity(&mut self, peer_id: &PeerId, now_ms: u64) -> Option<FailureEvent> {
        let record = self.records.get_mut(peer_id)?;
        let was_suspected = record.state == PeerState::Suspected;
        record.last_interaction = record.last_interaction.max(now_ms);
        record.state = PeerState::Alive;
        record.suspect_count = 0;
        was_suspected.then_some(FailureEvent::PeerRecovered { peer_id: *peer_id })
    }

    /// Advance every inactive record by one step.
    ///
    /// Events are ordered by peer id so replays are deterministic.
    pub fn sweep(&mut self, now_ms: u64) -> Vec<FailureEvent> {
        let tolerance_ms = self.config.tolerance.as_millis() as u64;
        let mut events = Vec::new();
        let mut failed = Vec::new();

        for record in self.records.values_mut() {
            let idle = now_ms.saturating_sub(record.last_interaction);
            if idle <= tolerance_ms {
                continue;
            }
            match record.state {
                PeerState::Alive => {
                    record.state = PeerState::Suspected;
                    record.suspect_count = 0;
                    events.push(FailureEvent::PeerSuspected {
                        peer_id: record.peer_id,
                    });
                }
                PeerState::Suspected => {
                    record.suspect_count += 1;
                    if record.suspect_count >= self.config.x_factor {
                        record.state = PeerState::Failed;
                        failed.push(record.peer_id);
                    }
                }
                PeerState::Failed => failed.push(record.peer_id),
            }
        }

        for peer_id in failed {
            self.records.remove(&peer_id);
            events.push(FailureEvent::PeerFailed { peer_id });
        }

        events.sort_by_key(|event| match event {
            FailureEvent::PeerSuspected { peer_id }
            | FailureEvent::PeerRecovered { peer_id }
            | FailureEvent::PeerFailed { peer_id } => *peer_id,
        });
        events
    }

    /// Current state of a peer, if tracked.
    pub fn state_of(&self, peer_id: &PeerId) -> Option<PeerState> {
        self.records.get(peer_id).map(|r| r.state)
    }

    pub fn record(&self, peer_id: &PeerId) -> Option<&FailureRecord> {
        self.records.get(peer_id)
    }

    pub fn is_tracked(&self, peer_id: &PeerId) -> bool {
        self.records.contains_key(peer_id)
    }

    pub fn tracked_count(&self) -> usize {
        self.records.len()
    }
}
