//! Game-room lifecycle.
//!
//! Every node holds a replica of every room. Replicas change only when a
//! [`RoomEvent`] is delivered by the broadcast orderer, so all nodes walk the
//! same transitions in the same order. The `check_*` methods validate a
//! player operation against the local replica before it is broadcast; the
//! same rules run again at delivery time, where a concurrent event may have
//! changed the outcome.
//!
//! ```text
//! PENDING ──(last join)──▶ FULL ──(START)──▶ RUNNING ──(winner)──▶ ENDED
//!    ▲                       │                   │
//!    └──────(leave)──────────┘                   └──(host leaves, < 2 players)──▶ ENDED
//! ```

use crate::protocol::{EventKind, RoomEvent};
use crate::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;
use tracing::info;

/// Rooms are keyed by their host.
pub type RoomId = PeerId;

/// Smallest room worth starting.
pub const MIN_CAPACITY: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RoomState {
    Pending,
    Full,
    Running,
    Ended,
}

impl RoomState {
    pub fn is_active(&self) -> bool {
        *self != RoomState::Ended
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Room {0} not found")]
    RoomNotFound(RoomId),
    #[error("Already hosting room {0}")]
    AlreadyHosting(RoomId),
    #[error("Already playing in room {0}")]
    InAnotherRoom(RoomId),
    #[error("Capacity must be at least {MIN_CAPACITY}, got {0}")]
    InvalidCapacity(usize),
    #[error("Room {0} is full")]
    RoomFull(RoomId),
    #[error("Room {0} is no longer accepting players")]
    NotPending(RoomId),
    #[error("Room {0} is not running")]
    NotRunning(RoomId),
    #[error("Already in room {0}")]
    AlreadyParticipant(RoomId),
    #[error("Not a participant of room {0}")]
    NotParticipant(RoomId),
    #[error("Only the host of room {0} may do that")]
    NotHost(RoomId),
    #[error("Room {0} has ended")]
    Ended(RoomId),
    #[error("Cannot apply {event:?} to room {room} in state {from:?}")]
    InvalidTransition {
        room: RoomId,
        from: RoomState,
        event: EventKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: PeerId,
    pub name: String,
}

/// Replica of one game room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameRoom {
    pub id: RoomId,
    pub host_name: String,
    pub capacity: usize,
    pub level: u32,
    pub state: RoomState,
    /// In join order; the host is always first
    pub participants: Vec<Participant>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub winner: Option<String>,
}

/// A change applied to a room replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Transition {
    Created {
        room: RoomId,
        capacity: usize,
        level: u32,
    },
    Joined {
        room: RoomId,
        peer: PeerId,
        name: String,
        full: bool,
    },
    Started {
        room: RoomId,
        participants: usize,
        level: u32,
    },
    Guessed {
        room: RoomId,
        player: String,
        guess: String,
    },
    Left {
        room: RoomId,
        peer: PeerId,
        name: String,
    },
    Said {
        room: RoomId,
        from: String,
        text: String,
    },
    Ended {
        room: RoomId,
        winner: Option<String>,
    },
}

impl GameRoom {
    fn new(host: PeerId, host_name: &str, capacity: usize, level: u32) -> Self {
        Self {
            id: host,
            host_name: host_name.to_string(),
            capacity,
            level,
            state: RoomState::Pending,
            participants: vec![Participant {
                id: host,
                name: host_name.to_string(),
            }],
            winner: None,
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.participants.iter().any(|p| p.id == *peer)
    }

    pub fn is_full(&self) -> bool {
        self.participants.len() >= self.capacity
    }

    fn end(&mut self, winner: Option<String>) -> Transition {
        self.state = RoomState::Ended;
        self.winner = winner.clone();
        info!("Room {} ended (winner: {:?})", self.id, winner);
        Transition::Ended {
            room: self.id,
            winner,
        }
    }

    /// Drop a participant; ends the room when the host goes or a running
    /// game is left with fewer than two players.
    fn remove(&mut self, peer: &PeerId) -> Vec<Transition> {
        let Some(index) = self.participants.iter().position(|p| p.id == *peer) else {
            return Vec::new();
        };
        let gone = self.participants.remove(index);
        let mut transitions = vec![Transition::Left {
            room: self.id,
            peer: gone.id,
            name: gone.name,
        }];

        // A full room stays full and starts with whoever is left
        let seated = matches!(self.state, RoomState::Full | RoomState::Running);
        if *peer == self.id || (seated && self.participants.len() < MIN_CAPACITY) {
            transitions.push(self.end(None));
        }
        transitions
    }
}

/// All room replicas on a node.
///
/// The map is behind a `RwLock`; each room has its own `Mutex` so unrelated
/// rooms never contend.
#[derive(Default)]
pub struct SessionManager {
    rooms: RwLock<BTreeMap<RoomId, Arc<Mutex<GameRoom>>>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn room(&self, id: &RoomId) -> Result<Arc<Mutex<GameRoom>>, SessionError> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(id).cloned().ok_or(SessionError::RoomNotFound(*id))
    }

    fn with_room<T>(
        &self,
        id: &RoomId,
        f: impl FnOnce(&mut GameRoom) -> Result<T, SessionError>,
    ) -> Result<T, SessionError> {
        let room = self.room(id)?;
        let mut room = room.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut room)
    }

    /// Active room a peer currently participates in.
    pub fn active_room_of(&self, peer: &PeerId) -> Option<RoomId> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.iter().find_map(|(id, room)| {
            let room = room.lock().unwrap_or_else(|e| e.into_inner());
            (room.state.is_active() && room.contains(peer)).then_some(*id)
        })
    }

    // ==================== Validation ====================

    pub fn check_propose(&self, host: PeerId, capacity: usize) -> Result<(), SessionError> {
        if capacity < MIN_CAPACITY {
            return Err(SessionError::InvalidCapacity(capacity));
        }
        match self.active_room_of(&host) {
            Some(room) if room == host => Err(SessionError::AlreadyHosting(room)),
            Some(room) => Err(SessionError::InAnotherRoom(room)),
            None => Ok(()),
        }
    }

    pub fn check_join(&self, room_id: RoomId, peer: PeerId) -> Result<(), SessionError> {
        self.with_room(&room_id, |room| {
            if room.state == RoomState::Ended {
                return Err(SessionError::Ended(room_id));
            }
            if room.contains(&peer) {
                return Err(SessionError::AlreadyParticipant(room_id));
            }
            if room.is_full() {
                return Err(SessionError::RoomFull(room_id));
            }
            if room.state != RoomState::Pending {
                return Err(SessionError::NotPending(room_id));
            }
            Ok(())
        })?;
        match self.active_room_of(&peer) {
            Some(other) => Err(SessionError::InAnotherRoom(other)),
            None => Ok(()),
        }
    }

    pub fn check_leave(&self, room_id: RoomId, peer: PeerId) -> Result<(), SessionError> {
        self.with_room(&room_id, |room| member_of_active(room, &peer))
    }

    pub fn check_guess(&self, room_id: RoomId, peer: PeerId) -> Result<(), SessionError> {
        self.with_room(&room_id, |room| {
            member_of_active(room, &peer)?;
            if room.state != RoomState::Running {
                return Err(SessionError::NotRunning(room_id));
            }
            Ok(())
        })
    }

    pub fn check_say(&self, room_id: RoomId, peer: PeerId) -> Result<(), SessionError> {
        self.with_room(&room_id, |room| member_of_active(room, &peer))
    }

    // ==================== Delivery ====================

    /// Apply a delivered event from `sender`.
    ///
    /// Must be called in delivery order. A rejected event leaves the replica
    /// untouched; every replica rejects it the same way.
    pub fn apply(
        &self,
        sender: PeerId,
        sender_name: &str,
        event: &RoomEvent,
    ) -> Result<Vec<Transition>, SessionError> {
        match event {
            RoomEvent::Propose {
                room,
                capacity,
                level,
            } => {
                if *room != sender {
                    return Err(SessionError::NotHost(*room));
                }
                self.check_propose(sender, *capacity)?;
                let created = GameRoom::new(sender, sender_name, *capacity, *level);
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                rooms.insert(sender, Arc::new(Mutex::new(created)));
                info!(
                    "Room {} proposed by {} (capacity {}, level {})",
                    sender, sender_name, capacity, level
                );
                Ok(vec![Transition::Created {
                    room: sender,
                    capacity: *capacity,
                    level: *level,
                }])
            }
            RoomEvent::Join { room } => {
                self.check_join(*room, sender)?;
                self.with_room(room, |r| {
                    r.participants.push(Participant {
                        id: sender,
                        name: sender_name.to_string(),
                    });
                    let full = r.is_full();
                    if full {
                        r.state = RoomState::Full;
                    }
                    info!(
                        "{} joined room {} ({}/{})",
                        sender_name,
                        room,
                        r.participants.len(),
                        r.capacity
                    );
                    Ok(vec![Transition::Joined {
                        room: *room,
                        peer: sender,
                        name: sender_name.to_string(),
                        full,
                    }])
                })
            }
            RoomEvent::Start { room } => self.with_room(room, |r| {
                if sender != r.id {
                    return Err(SessionError::NotHost(*room));
                }
                if r.state != RoomState::Full {
                    return Err(SessionError::InvalidTransition {
                        room: *room,
                        from: r.state,
                        event: EventKind::Start,
                    });
                }
                r.state = RoomState::Running;
                info!("Room {} started with {} players", room, r.participants.len());
                Ok(vec![Transition::Started {
                    room: *room,
                    participants: r.participants.len(),
                    level: r.level,
                }])
            }),
            RoomEvent::Guess { room, guess } => {
                self.check_guess(*room, sender)?;
                Ok(vec![Transition::Guessed {
                    room: *room,
                    player: sender_name.to_string(),
                    guess: guess.clone(),
                }])
            }
            RoomEvent::Leave { room } => self.with_room(room, |r| {
                member_of_active(r, &sender)?;
                Ok(r.remove(&sender))
            }),
            RoomEvent::Say { room, text, winner } => self.with_room(room, |r| {
                member_of_active(r, &sender)?;
                let said = Transition::Said {
                    room: *room,
                    from: sender_name.to_string(),
                    text: text.clone(),
                };
                let Some(winner) = winner else {
                    return Ok(vec![said]);
                };
                if sender != r.id {
                    return Err(SessionError::NotHost(*room));
                }
                if r.state != RoomState::Running {
                    return Err(SessionError::NotRunning(*room));
                }
                Ok(vec![said, r.end(Some(winner.clone()))])
            }),
        }
    }

    /// Remove a failed peer from every active room it occupies.
    pub fn evict(&self, peer: &PeerId) -> Vec<Transition> {
        let rooms: Vec<_> = {
            let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut transitions = Vec::new();
        for room in rooms {
            let mut room = room.lock().unwrap_or_else(|e| e.into_inner());
            if room.state.is_active() {
                transitions.extend(room.remove(peer));
            }
        }
        transitions
    }

    // ==================== Queries ====================

    /// Copy of one room.
    pub fn snapshot(&self, room: &RoomId) -> Option<GameRoom> {
        let room = self.room(room).ok()?;
        let room = room.lock().unwrap_or_else(|e| e.into_inner());
        Some(room.clone())
    }

    /// Copy of every room, ordered by id.
    pub fn rooms(&self) -> Vec<GameRoom> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .values()
            .map(|room| room.lock().unwrap_or_else(|e| e.into_inner()).clone())
            .collect()
    }

    pub fn state_of(&self, room: &RoomId) -> Option<RoomState> {
        self.snapshot(room).map(|r| r.state)
    }
}

fn member_of_active(room: &GameRoom, peer: &PeerId) -> Result<(), SessionError> {
    if room.state == RoomState::Ended {
        return Err(SessionError::Ended(room.id));
    }
    if !room.contains(peer) {
        return Err(SessionError::NotParticipant(room.id));
    }
    Ok(())
}
