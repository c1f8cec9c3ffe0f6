//! room-core: coordination layer for multiplayer game rooms spread across
//! independent player processes.
//!
//! This crate provides:
//! - Lamport clocks and total-order reliable broadcast
//! - Inactivity-based failure detection with eviction
//! - At-most-once remote calls through per-caller sequence windows
//! - The replicated game-room state machine
//! - A `Node` composing all of the above behind one remote-call entry point,
//!   with a transport abstraction and an in-process implementation

pub mod broadcast;
pub mod clock;
pub mod collab;
pub mod dedup;
pub mod directory;
pub mod events;
pub mod failure;
pub mod node;
pub mod peer_id;
pub mod protocol;
pub mod session;
pub mod transport;

pub use broadcast::{BroadcastOrderer, Removed};
pub use clock::LogicalClock;
pub use collab::{InMemoryScores, Outcome, PuzzleEngine, PuzzleHandle, Score, ScoreStore, WordListPuzzle};
pub use dedup::{Admission, DedupGateway};
pub use directory::{DirectoryError, PeerDirectory, PeerRef};
pub use events::{EventBus, MeshEvent, Subscription};
pub use failure::{FailureEvent, FailureMonitor, FailureRecord, MonitorConfig, MonitorConfigError, PeerState};
pub use node::{Node, NodeConfig, NodeError, RetryPolicy};
pub use peer_id::{Caller, PeerId, PeerIdError};
pub use protocol::{NodeStatus, RemoteCall, Reply, Request};
pub use session::{GameRoom, RoomId, RoomState, SessionError, SessionManager, Transition};
pub use transport::{LocalHandle, LocalNetwork, PeerHandle, TransportError};
