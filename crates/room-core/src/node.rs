//! A player node: every coordination component composed behind one
//! remote-call entry point.
//!
//! ```text
//!   RemoteCall ─▶ DedupGateway ─▶ FailureMonitor activity ─▶ dispatch
//!                                                              │
//!        peer protocol (Deliver / Acknowledge / Ping) ◀────────┤
//!        player operations (Propose / Join / Guess …) ◀────────┘
//!                     │ broadcast
//!                     ▼
//!   BroadcastOrderer ──delivered──▶ applier task ─▶ SessionManager
//!          │                                  └──▶ host follow-ups
//!          └─▶ per-peer outbox tasks ─▶ PeerHandle
//! ```
//!
//! Background tasks (spawned by [`Node::spawn`]):
//! - applier: applies delivered envelopes and evictions in order
//! - heartbeat: pings every peer each `heartbeat_interval`
//! - sweep: advances the failure monitor each `check_interval`
//! - one outbox per registered peer

use crate::broadcast::BroadcastOrderer;
use crate::clock::LogicalClock;
use crate::collab::{PuzzleEngine, PuzzleHandle, ScoreStore};
use crate::dedup::{Admission, DEFAULT_WINDOW, DedupGateway};
use crate::directory::{DirectoryError, PeerDirectory, Registered};
use crate::events::{EventBus, MeshEvent};
use crate::failure::{FailureEvent, FailureMonitor, MonitorConfig, MonitorConfigError, now_ms};
use crate::protocol::{
    Ack, Envelope, NodeStatus, PeerStatus, RemoteCall, Reply, Request, RoomEvent,
};
use crate::session::{GameRoom, RoomId, SessionError, SessionManager, Transition};
use crate::transport::PeerHandle;
use crate::{Caller, PeerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Backoff for outbound calls that fail.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Delay after the first failure, doubled per attempt (default: 50ms)
    pub initial_delay: Duration,
    /// Cap on the delay (default: 1s)
    pub max_delay: Duration,
    /// Failed attempts before a warning is logged (default: 3)
    pub warn_after: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(1),
            warn_after: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
        self.initial_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Node configuration.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub id: PeerId,
    /// Player display name
    pub name: String,
    /// Identifies this process start; see [`Caller`]
    pub incarnation: u64,
    pub monitor: MonitorConfig,
    /// How often every peer is pinged (default: 1s)
    pub heartbeat_interval: Duration,
    /// Bound on waiting for a player operation to deliver (default: 10s)
    pub delivery_timeout: Duration,
    /// Backoff for failed outbound calls
    pub retry: RetryPolicy,
    /// Replies remembered per caller (default: 32)
    pub dedup_window: usize,
}

impl NodeConfig {
    pub fn new(id: PeerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            incarnation: now_ms(),
            monitor: MonitorConfig::default(),
            heartbeat_interval: Duration::from_secs(1),
            delivery_timeout: Duration::from_secs(10),
            retry: RetryPolicy::default(),
            dedup_window: DEFAULT_WINDOW,
        }
    }
}

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Invalid failure monitor configuration: {0}")]
    Monitor(#[from] MonitorConfigError),
    #[error("Node name cannot be empty")]
    EmptyName,
}

type DeliveryResult = Result<Vec<Transition>, SessionError>;

/// Work for the applier, in delivery order.
enum Work {
    Deliver(Envelope),
    Evict(PeerId),
}

pub struct Node {
    config: NodeConfig,
    caller: Caller,
    clock: Arc<LogicalClock>,
    orderer: Mutex<BroadcastOrderer>,
    work: mpsc::UnboundedSender<Work>,
    waiters: Mutex<HashMap<(u64, PeerId), oneshot::Sender<DeliveryResult>>>,
    directory: PeerDirectory,
    monitor: Mutex<FailureMonitor>,
    dedup: Mutex<DedupGateway<Reply>>,
    sessions: SessionManager,
    puzzle: Arc<dyn PuzzleEngine>,
    scores: Arc<dyn ScoreStore>,
    puzzles: Mutex<HashMap<RoomId, PuzzleHandle>>,
    events: Arc<EventBus>,
    next_seq: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Node {
    /// Build a node and start its background tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn(
        config: NodeConfig,
        puzzle: Arc<dyn PuzzleEngine>,
        scores: Arc<dyn ScoreStore>,
    ) -> Result<Arc<Self>, NodeError> {
        if config.name.trim().is_empty() {
            return Err(NodeError::EmptyName);
        }
        let monitor = FailureMonitor::new(config.monitor.clone())?;
        let clock = Arc::new(LogicalClock::new());
        let (work, work_rx) = mpsc::unbounded_channel();

        let node = Arc::new(Self {
            caller: Caller::new(config.id, config.incarnation),
            orderer: Mutex::new(BroadcastOrderer::new(
                config.id,
                config.name.clone(),
                Arc::clone(&clock),
            )),
            clock,
            work,
            waiters: Mutex::new(HashMap::new()),
            directory: PeerDirectory::new(config.id),
            monitor: Mutex::new(monitor),
            dedup: Mutex::new(DedupGateway::new(config.dedup_window)),
            sessions: SessionManager::new(),
            puzzle,
            scores,
            puzzles: Mutex::new(HashMap::new()),
            events: Arc::new(EventBus::new()),
            next_seq: AtomicU64::new(1),
            tasks: Mutex::new(Vec::new()),
            config,
        });

        let weak = Arc::downgrade(&node);
        let tasks = vec![
            tokio::spawn(run_applier(weak.clone(), work_rx)),
            tokio::spawn(run_heartbeat(weak.clone(), node.config.heartbeat_interval)),
            tokio::spawn(run_sweep(weak, node.config.monitor.check_interval)),
        ];
        node.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .extend(tasks);

        info!(
            "Node {} ({}) started, incarnation {}",
            node.config.id, node.config.name, node.config.incarnation
        );
        Ok(node)
    }

    pub fn id(&self) -> PeerId {
        self.config.id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Identity this node uses for its own calls.
    pub fn caller(&self) -> Caller {
        self.caller
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    pub fn room(&self, id: &RoomId) -> Option<GameRoom> {
        self.sessions.snapshot(id)
    }

    /// Next sequence number for an outbound or local call.
    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    // ==================== Membership ====================

    /// Make a peer reachable, or swap in a new handle after a reconnect.
    pub fn register_peer(
        self: &Arc<Self>,
        id: PeerId,
        name: &str,
        handle: Arc<dyn PeerHandle>,
    ) -> Result<(), DirectoryError> {
        let description = handle.describe();
        match self.directory.register(id, name, handle)? {
            Registered::New(outbox) => {
                // Directory first: a participant we expect acks from must
                // already receive our broadcasts.
                self.orderer
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .add_participant(id);
                self.monitor
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .register_client(id, now_ms());
                let task = tokio::spawn(run_outbox(Arc::downgrade(self), id, outbox));
                self.tasks
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push(task);
                info!("Peer {} ({}) registered via {}", id, name, description);
                self.events.emit(MeshEvent::PeerJoined {
                    peer_id: id,
                    name: name.to_string(),
                });
            }
            Registered::Updated => {
                self.monitor
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .update_activity(&id, now_ms());
                debug!("Peer {} reconnected via {}", id, description);
            }
        }
        Ok(())
    }

    /// Remove a failed peer everywhere: directory, failure tracking, pending
    /// acknowledgments, and (in delivery order) its rooms.
    pub fn evict_peer(&self, peer: &PeerId) {
        if self.directory.remove(peer).is_none() {
            return;
        }
        self.monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .unregister_client(peer);
        {
            let mut orderer = self.orderer.lock().unwrap_or_else(|e| e.into_inner());
            let removed = orderer.remove_participant(peer);
            for envelope in removed.relay {
                debug!("Relaying {}@{} for evicted peer", envelope.sender_id, envelope.timestamp);
                self.directory.post_all(&Request::Deliver { envelope });
            }
            self.forward(removed.delivered);
            let _ = self.work.send(Work::Evict(*peer));
        }
        warn!("Peer {} evicted", peer);
        self.events.emit(MeshEvent::PeerFailed { peer_id: *peer });
    }

    /// Run one failure-monitor sweep at `now_ms` and act on the results.
    pub fn sweep(&self, now_ms: u64) -> Vec<FailureEvent> {
        let events = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .sweep(now_ms);
        for event in &events {
            match *event {
                FailureEvent::PeerSuspected { peer_id } => {
                    warn!("Peer {} suspected", peer_id);
                    self.events.emit(MeshEvent::PeerSuspected { peer_id });
                }
                FailureEvent::PeerRecovered { peer_id } => {
                    self.events.emit(MeshEvent::PeerRecovered { peer_id });
                }
                FailureEvent::PeerFailed { peer_id } => self.evict_peer(&peer_id),
            }
        }
        events
    }

    // ==================== RPC boundary ====================

    /// Handle one remote call. Never fails: every outcome is a [`Reply`].
    pub async fn handle(&self, call: RemoteCall) -> Reply {
        let admission = self
            .dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .admit(call.caller, call.seq);
        match admission {
            Admission::Fresh => {}
            Admission::Replay(reply) => {
                debug!("Replaying {} #{} for {}", call.request.name(), call.seq, call.caller);
                return reply;
            }
            Admission::InFlight(original) => {
                return original.await.unwrap_or(Reply::Duplicate { seq: call.seq });
            }
            Admission::Duplicate => {
                debug!("Dropping duplicate #{} from {}", call.seq, call.caller);
                return Reply::Duplicate { seq: call.seq };
            }
        }

        let recovered = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .update_activity(&call.caller.peer, now_ms());
        if let Some(FailureEvent::PeerRecovered { peer_id }) = recovered {
            info!("Peer {} recovered", peer_id);
            self.events.emit(MeshEvent::PeerRecovered { peer_id });
        }

        let (caller, seq) = (call.caller, call.seq);
        let reply = self.dispatch(call).await;
        self.dedup
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .complete(caller, seq, reply.clone());
        reply
    }

    /// Issue a call against this node under its own identity (console use).
    pub async fn call_local(&self, request: Request) -> Reply {
        let call = RemoteCall {
            caller: self.caller,
            seq: self.next_seq(),
            request,
        };
        self.handle(call).await
    }

    async fn dispatch(&self, call: RemoteCall) -> Reply {
        let me = self.id();
        match call.request {
            Request::Deliver { envelope } => self.on_deliver(call.caller.peer, envelope),
            Request::Acknowledge { ack } => self.on_acknowledge(call.caller.peer, ack),
            Request::Ping => Reply::Pong,
            Request::Status => Reply::Status {
                status: self.status(),
            },
            Request::Propose { capacity, level } => {
                if let Err(e) = self.sessions.check_propose(me, capacity) {
                    return Reply::rejected(e);
                }
                let event = RoomEvent::Propose {
                    room: me,
                    capacity,
                    level,
                };
                self.submit(event, |room, timestamp| Reply::Proposed { room, timestamp })
                    .await
            }
            Request::Join { room } => {
                if let Err(e) = self.sessions.check_join(room, me) {
                    return Reply::rejected(e);
                }
                self.submit(RoomEvent::Join { room }, |room, timestamp| Reply::Joined {
                    room,
                    timestamp,
                })
                .await
            }
            Request::Leave { room } => {
                if let Err(e) = self.sessions.check_leave(room, me) {
                    return Reply::rejected(e);
                }
                self.submit(RoomEvent::Leave { room }, |room, timestamp| Reply::Left {
                    room,
                    timestamp,
                })
                .await
            }
            Request::Guess { room, guess } => {
                if guess.trim().is_empty() {
                    return Reply::rejected("Guess cannot be empty");
                }
                if let Err(e) = self.sessions.check_guess(room, me) {
                    return Reply::rejected(e);
                }
                self.submit(RoomEvent::Guess { room, guess }, |room, timestamp| {
                    Reply::GuessSubmitted { room, timestamp }
                })
                .await
            }
            Request::Say { room, text } => {
                if let Err(e) = self.sessions.check_say(room, me) {
                    return Reply::rejected(e);
                }
                let event = RoomEvent::Say {
                    room,
                    text,
                    winner: None,
                };
                self.submit(event, |room, timestamp| Reply::Said { room, timestamp })
                    .await
            }
        }
    }

    /// Accept an envelope from its sender, or relayed by another peer after
    /// the sender was evicted there.
    fn on_deliver(&self, from: PeerId, envelope: Envelope) -> Reply {
        if !self.directory.contains(&from) {
            return Reply::rejected(format!("Unknown peer {}", from));
        }
        debug!(
            "Received {:?}@{} from {} via {}",
            envelope.kind, envelope.timestamp, envelope.sender_name, from
        );
        let mut orderer = self.orderer.lock().unwrap_or_else(|e| e.into_inner());
        let received = orderer.on_message(envelope);
        if let Some(ack) = received.ack {
            self.directory.post_all(&Request::Acknowledge { ack });
        }
        self.forward(received.delivered);
        Reply::Accepted
    }

    fn on_acknowledge(&self, from: PeerId, ack: Ack) -> Reply {
        if ack.acker_id != from {
            return Reply::rejected(format!(
                "Acknowledgment by {} relayed by {}",
                ack.acker_id, from
            ));
        }
        let mut orderer = self.orderer.lock().unwrap_or_else(|e| e.into_inner());
        let delivered = orderer.on_ack(ack);
        self.forward(delivered);
        Reply::Accepted
    }

    // ==================== Broadcast ====================

    /// Stamp, queue and fan out a room event.
    ///
    /// Fan-out happens under the orderer lock so every outbox sees envelopes
    /// in stamp order.
    fn broadcast(&self, event: &RoomEvent) -> (u64, oneshot::Receiver<DeliveryResult>) {
        let (kind, content) = event.encode();
        let (tx, rx) = oneshot::channel();
        let mut orderer = self.orderer.lock().unwrap_or_else(|e| e.into_inner());
        let stamped = orderer.stamp(kind, content);
        let timestamp = stamped.envelope.timestamp;
        self.waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(stamped.envelope.order_key(), tx);
        self.directory.post_all(&Request::Deliver {
            envelope: stamped.envelope,
        });
        self.forward(stamped.delivered);
        (timestamp, rx)
    }

    /// Broadcast and wait for local delivery.
    async fn submit(&self, event: RoomEvent, accepted: fn(RoomId, u64) -> Reply) -> Reply {
        let room = event.room();
        let (timestamp, delivered) = self.broadcast(&event);
        match tokio::time::timeout(self.config.delivery_timeout, delivered).await {
            Ok(Ok(Ok(_))) => accepted(room, timestamp),
            Ok(Ok(Err(e))) => Reply::rejected(e),
            Ok(Err(_)) => Reply::rejected("Node is shutting down"),
            Err(_) => {
                self.waiters
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&(timestamp, self.id()));
                warn!(
                    "{:?} at {} not delivered within {:?}",
                    event.kind(),
                    timestamp,
                    self.config.delivery_timeout
                );
                Reply::TimedOut { timestamp }
            }
        }
    }

    fn forward(&self, delivered: Vec<Envelope>) {
        for envelope in delivered {
            let _ = self.work.send(Work::Deliver(envelope));
        }
    }

    // ==================== Delivery ====================

    fn apply(&self, work: Work) {
        match work {
            Work::Deliver(envelope) => self.apply_envelope(envelope),
            Work::Evict(peer) => {
                let transitions = self.sessions.evict(&peer);
                self.follow_up(&transitions);
            }
        }
    }

    fn apply_envelope(&self, envelope: Envelope) {
        self.events.emit(MeshEvent::Delivered {
            timestamp: envelope.timestamp,
            sender_id: envelope.sender_id,
            sender_name: envelope.sender_name.clone(),
            kind: envelope.kind,
        });

        let event = match RoomEvent::from_envelope(&envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "Undecodable {:?} from {}: {}",
                    envelope.kind, envelope.sender_id, e
                );
                return;
            }
        };
        let result = self
            .sessions
            .apply(envelope.sender_id, &envelope.sender_name, &event);
        match &result {
            Ok(transitions) => self.follow_up(transitions),
            Err(e) => {
                debug!("Refused {:?} from {}: {}", envelope.kind, envelope.sender_name, e);
                self.events.emit(MeshEvent::Refused {
                    sender_name: envelope.sender_name.clone(),
                    reason: e.to_string(),
                });
            }
        }

        let waiter = self
            .waiters
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&envelope.order_key());
        if let Some(waiter) = waiter {
            let _ = waiter.send(result);
        }
    }

    /// Publish transitions and run the host's duties for its own room.
    fn follow_up(&self, transitions: &[Transition]) {
        let me = self.id();
        for transition in transitions {
            self.events.emit(MeshEvent::Room {
                transition: transition.clone(),
            });
            match transition {
                Transition::Joined {
                    room, full: true, ..
                } if *room == me => {
                    info!("Room {} is full, starting", room);
                    self.broadcast(&RoomEvent::Start { room: *room });
                }
                Transition::Started {
                    room,
                    participants,
                    level,
                } if *room == me => {
                    let handle = self.puzzle.start_puzzle(*participants, *level);
                    self.puzzles
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(*room, handle);
                }
                Transition::Guessed {
                    room,
                    player,
                    guess,
                } if *room == me => self.judge(*room, player, guess),
                Transition::Ended { room, winner } if *room == me => {
                    let handle = self
                        .puzzles
                        .lock()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(room);
                    if let Some(handle) = handle {
                        self.puzzle.finish(handle);
                    }
                    if let Some(winner) = winner {
                        info!("{} won room {}", winner, room);
                        self.scores.update_score(winner, 1, true);
                    }
                }
                _ => {}
            }
        }
    }

    /// Host side of a guess: ask the puzzle engine and announce the outcome.
    fn judge(&self, room: RoomId, player: &str, guess: &str) {
        let handle = self
            .puzzles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&room)
            .copied();
        // Solved already; the winning announcement is in flight
        let Some(handle) = handle else {
            return;
        };

        let outcome = self.puzzle.apply_guess(handle, guess, player);
        let text = match (outcome.correct, outcome.solved) {
            (true, true) => format!("{} found \"{}\" and solved the puzzle!", player, guess),
            (true, false) => format!("{} found \"{}\"", player, guess),
            (false, _) => format!("\"{}\" is not one of the words", guess),
        };
        let winner = outcome.solved.then(|| player.to_string());
        if outcome.solved {
            self.puzzles
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&room);
            self.puzzle.finish(handle);
        }
        self.broadcast(&RoomEvent::Say { room, text, winner });
    }

    // ==================== Status ====================

    pub fn status(&self) -> NodeStatus {
        let peers = {
            let monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            self.directory
                .snapshot()
                .into_iter()
                .map(|peer| PeerStatus {
                    state: monitor.state_of(&peer.id),
                    id: peer.id,
                    name: peer.name,
                })
                .collect()
        };
        NodeStatus {
            node_id: self.id(),
            name: self.config.name.clone(),
            clock: self.clock.now(),
            peers,
            pending_messages: self.pending_messages(),
            rooms: self.sessions.rooms(),
        }
    }

    /// Envelopes held back waiting for acknowledgments.
    pub fn pending_messages(&self) -> usize {
        self.orderer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pending_len()
    }

    pub fn peer_ids(&self) -> Vec<PeerId> {
        self.directory.ids()
    }

    /// Stop every background task.
    pub fn shutdown(&self) {
        let tasks = std::mem::take(&mut *self.tasks.lock().unwrap_or_else(|e| e.into_inner()));
        for task in tasks {
            task.abort();
        }
        info!("Node {} stopped", self.config.id);
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

// ==================== Background tasks ====================

async fn run_applier(node: Weak<Node>, mut work: mpsc::UnboundedReceiver<Work>) {
    while let Some(item) = work.recv().await {
        let Some(node) = node.upgrade() else {
            break;
        };
        node.apply(item);
    }
}

async fn run_heartbeat(node: Weak<Node>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(node) = node.upgrade() else {
            break;
        };
        node.directory.post_all(&Request::Ping);
    }
}

async fn run_sweep(node: Weak<Node>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(node) = node.upgrade() else {
            break;
        };
        node.sweep(now_ms());
    }
}

/// Deliver one peer's requests in order.
///
/// A failed call is retried with the same sequence number, so the receiver
/// can drop repeats, until it succeeds or the peer leaves the directory.
/// Later requests wait behind it.
async fn run_outbox(node: Weak<Node>, peer: PeerId, mut requests: mpsc::UnboundedReceiver<Request>) {
    while let Some(request) = requests.recv().await {
        let Some((mut handle, call, policy)) = node.upgrade().and_then(|node| {
            let target = node.directory.get(&peer)?;
            let call = RemoteCall {
                caller: node.caller,
                seq: node.next_seq(),
                request,
            };
            Some((target.handle, call, node.config.retry.clone()))
        }) else {
            break;
        };

        let mut attempt = 0;
        loop {
            match handle.call(call.clone()).await {
                Ok(Reply::Rejected { reason }) => {
                    debug!("{} rejected {}: {}", peer, call.request.name(), reason);
                    break;
                }
                Ok(_) => break,
                Err(e) => {
                    attempt += 1;
                    if attempt == policy.warn_after {
                        warn!(
                            "{} #{} to {} still failing after {} attempts: {}",
                            call.request.name(),
                            call.seq,
                            peer,
                            attempt,
                            e
                        );
                    } else {
                        debug!("{} to {} failed ({}), retrying", call.request.name(), peer, e);
                    }
                    tokio::time::sleep(policy.delay(attempt)).await;

                    // A reconnect swaps the handle
                    let Some(target) = node.upgrade().and_then(|node| node.directory.get(&peer)) else {
                        debug!("Dropping {} #{}: {} left", call.request.name(), call.seq, peer);
                        break;
                    };
                    handle = target.handle;
                }
            }
        }
    }
    debug!("Outbox for {} closed", peer);
}
