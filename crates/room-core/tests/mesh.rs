//! Multi-node tests over the in-process transport.
//!
//! Each test builds a full mesh of nodes on one `LocalNetwork` and drives it
//! through the same remote-call boundary a real front-end would use.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use room_core::protocol::EventKind;
use room_core::{
    Caller, InMemoryScores, LocalNetwork, MeshEvent, MonitorConfig, Node, NodeConfig, PeerId,
    RemoteCall, Reply, Request, RoomState, Score, ScoreStore, Subscription, WordListPuzzle,
};
use tokio::time::{sleep, Instant};

// ============================================================================
// Helpers
// ============================================================================

/// Score store that remembers every update it receives.
#[derive(Default)]
struct CountingScores {
    inner: InMemoryScores,
    updates: Mutex<Vec<(String, i64, bool)>>,
}

impl ScoreStore for CountingScores {
    fn update_score(&self, name: &str, delta: i64, multiplayer: bool) {
        self.updates
            .lock()
            .unwrap()
            .push((name.to_string(), delta, multiplayer));
        self.inner.update_score(name, delta, multiplayer);
    }

    fn get_score(&self, name: &str) -> Score {
        self.inner.get_score(name)
    }
}

impl CountingScores {
    fn updates(&self) -> Vec<(String, i64, bool)> {
        self.updates.lock().unwrap().clone()
    }
}

fn config(id: u64, name: &str) -> NodeConfig {
    let mut config = NodeConfig::new(PeerId::from(id), name);
    config.delivery_timeout = Duration::from_secs(5);
    config
}

/// Timing tight enough to evict a silent peer in well under a second.
fn fast_failure(mut config: NodeConfig) -> NodeConfig {
    config.monitor = MonitorConfig {
        tolerance: Duration::from_millis(200),
        check_interval: Duration::from_millis(50),
        x_factor: 2,
    };
    config.heartbeat_interval = Duration::from_millis(50);
    config
}

struct Mesh {
    network: Arc<LocalNetwork>,
    nodes: Vec<Arc<Node>>,
    scores: Arc<CountingScores>,
}

impl Mesh {
    /// Spawn nodes over one network and connect every pair.
    ///
    /// Every node's puzzle hides the single word "alpha".
    fn build(configs: Vec<NodeConfig>) -> Self {
        let network = LocalNetwork::new();
        let scores = Arc::new(CountingScores::default());
        let nodes = configs
            .into_iter()
            .map(|config| {
                let node = Node::spawn(
                    config,
                    Arc::new(WordListPuzzle::new(["alpha"])),
                    scores.clone(),
                )
                .expect("node should start");
                network.attach(&node);
                node
            })
            .collect();
        network.connect_all().expect("mesh should connect");
        Self {
            network,
            nodes,
            scores,
        }
    }

    fn node(&self, name: &str) -> &Arc<Node> {
        self.nodes
            .iter()
            .find(|n| n.name() == name)
            .expect("unknown node name")
    }
}

/// Poll until `condition` holds, failing the test after 5 seconds.
async fn eventually(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        if Instant::now() > deadline {
            panic!("Timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(10)).await;
    }
}

fn room_state(node: &Node, room: PeerId) -> Option<RoomState> {
    node.room(&room).map(|r| r.state)
}

/// Record the order key of every envelope a node delivers.
fn record_deliveries(node: &Node) -> (Subscription, Arc<Mutex<Vec<(u64, PeerId, EventKind)>>>) {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let subscription = node.events().subscribe(move |event| {
        if let MeshEvent::Delivered {
            timestamp,
            sender_id,
            kind,
            ..
        } = event
        {
            sink.lock().unwrap().push((timestamp, sender_id, kind));
        }
    });
    (subscription, log)
}

async fn propose(node: &Node, capacity: usize, level: u32) -> PeerId {
    match node.call_local(Request::Propose { capacity, level }).await {
        Reply::Proposed { room, .. } => room,
        other => panic!("propose failed: {:?}", other),
    }
}

// ============================================================================
// Game scenarios
// ============================================================================

#[tokio::test]
async fn test_alice_and_bob_play_to_a_win() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");

    let room = propose(alice, 2, 3).await;
    assert_eq!(room, alice.id());
    let pending = alice.room(&room).unwrap();
    assert_eq!(pending.state, RoomState::Pending);
    assert_eq!(pending.participants.len(), 1);

    eventually("bob to see the room", || bob.room(&room).is_some()).await;
    let reply = bob.call_local(Request::Join { room }).await;
    assert!(matches!(reply, Reply::Joined { .. }), "got {:?}", reply);

    eventually("room to run everywhere", || {
        mesh.nodes
            .iter()
            .all(|n| room_state(n, room) == Some(RoomState::Running))
    })
    .await;

    let reply = bob
        .call_local(Request::Guess {
            room,
            guess: "alpha".into(),
        })
        .await;
    assert!(matches!(reply, Reply::GuessSubmitted { .. }), "got {:?}", reply);

    eventually("room to end everywhere", || {
        mesh.nodes
            .iter()
            .all(|n| room_state(n, room) == Some(RoomState::Ended))
    })
    .await;
    for node in &mesh.nodes {
        assert_eq!(node.room(&room).unwrap().winner.as_deref(), Some("bob"));
    }

    // Only the host reports the win, exactly once
    sleep(Duration::from_millis(50)).await;
    assert_eq!(mesh.scores.updates(), vec![("bob".to_string(), 1, true)]);
    assert_eq!(mesh.scores.get_score("bob").multiplayer, 1);
}

#[tokio::test]
async fn test_wrong_guess_keeps_game_running() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");

    let room = propose(alice, 2, 1).await;
    eventually("bob to see the room", || bob.room(&room).is_some()).await;
    bob.call_local(Request::Join { room }).await;
    eventually("room to run", || room_state(bob, room) == Some(RoomState::Running)).await;

    let (_sub, log) = record_deliveries(bob);
    let reply = bob
        .call_local(Request::Guess {
            room,
            guess: "omega".into(),
        })
        .await;
    assert!(matches!(reply, Reply::GuessSubmitted { .. }));

    // The host's verdict arrives as a TEXT event
    eventually("verdict", || {
        log.lock()
            .unwrap()
            .iter()
            .any(|(_, sender, kind)| *sender == alice.id() && *kind == EventKind::Text)
    })
    .await;
    assert_eq!(room_state(bob, room), Some(RoomState::Running));
    assert!(mesh.scores.updates().is_empty());
}

#[tokio::test]
async fn test_capacity_three_room_accepts_exactly_three() {
    let mesh = Mesh::build(vec![
        config(1, "alice"),
        config(2, "bob"),
        config(3, "carol"),
        config(4, "dave"),
    ]);
    let alice = mesh.node("alice");
    let room = propose(alice, 3, 1).await;
    eventually("everyone to see the room", || {
        mesh.nodes.iter().all(|n| n.room(&room).is_some())
    })
    .await;

    let reply = mesh.node("bob").call_local(Request::Join { room }).await;
    assert!(matches!(reply, Reply::Joined { .. }));
    // Two of three seats taken: still waiting for players
    assert_eq!(room_state(alice, room), Some(RoomState::Pending));

    eventually("carol to see bob", || {
        mesh.node("carol").room(&room).unwrap().participants.len() == 2
    })
    .await;
    let reply = mesh.node("carol").call_local(Request::Join { room }).await;
    assert!(matches!(reply, Reply::Joined { .. }));

    eventually("room to run everywhere", || {
        mesh.nodes
            .iter()
            .all(|n| room_state(n, room) == Some(RoomState::Running))
    })
    .await;

    let reply = mesh.node("dave").call_local(Request::Join { room }).await;
    match reply {
        Reply::Rejected { reason } => assert!(reason.contains("full"), "reason: {}", reason),
        other => panic!("fourth join should be rejected, got {:?}", other),
    }
    for node in &mesh.nodes {
        assert_eq!(node.room(&room).unwrap().participants.len(), 3);
    }
}

#[tokio::test]
async fn test_concurrent_joins_race_for_last_seat() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob"), config(3, "carol")]);
    let room = propose(mesh.node("alice"), 2, 1).await;
    eventually("everyone to see the room", || {
        mesh.nodes.iter().all(|n| n.room(&room).is_some())
    })
    .await;

    let (from_bob, from_carol) = tokio::join!(
        mesh.node("bob").call_local(Request::Join { room }),
        mesh.node("carol").call_local(Request::Join { room }),
    );
    let winners = [&from_bob, &from_carol]
        .iter()
        .filter(|r| matches!(r, Reply::Joined { .. }))
        .count();
    assert_eq!(winners, 1, "bob: {:?}, carol: {:?}", from_bob, from_carol);

    eventually("replicas to agree", || {
        let rosters: Vec<_> = mesh
            .nodes
            .iter()
            .map(|n| n.room(&room).unwrap().participants)
            .collect();
        rosters[0].len() == 2 && rosters.iter().all(|r| *r == rosters[0])
    })
    .await;
}

#[tokio::test]
async fn test_protocol_violations_rejected_synchronously() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");

    let reply = alice
        .call_local(Request::Propose {
            capacity: 1,
            level: 1,
        })
        .await;
    assert!(reply.is_rejected());

    let room = propose(alice, 2, 1).await;
    assert!(alice
        .call_local(Request::Propose {
            capacity: 2,
            level: 1
        })
        .await
        .is_rejected());

    eventually("bob to see the room", || bob.room(&room).is_some()).await;
    let reply = bob
        .call_local(Request::Guess {
            room,
            guess: "alpha".into(),
        })
        .await;
    assert!(reply.is_rejected(), "guess before joining: {:?}", reply);

    let reply = bob
        .call_local(Request::Join {
            room: PeerId::from(0x99),
        })
        .await;
    assert!(reply.is_rejected());
}

// ============================================================================
// Ordering
// ============================================================================

#[tokio::test]
async fn test_equal_timestamps_deliver_in_sender_order() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let (_sa, log_a) = record_deliveries(alice);
    let (_sb, log_b) = record_deliveries(bob);

    // Both stamp before either hears from the other
    let (ra, rb) = tokio::join!(
        alice.call_local(Request::Propose {
            capacity: 2,
            level: 1
        }),
        bob.call_local(Request::Propose {
            capacity: 2,
            level: 1
        }),
    );
    let (Reply::Proposed { timestamp: ta, .. }, Reply::Proposed { timestamp: tb, .. }) = (ra, rb)
    else {
        panic!("both proposals should succeed");
    };
    assert_eq!(ta, tb);

    let expected = vec![
        (ta, alice.id(), EventKind::Join),
        (tb, bob.id(), EventKind::Join),
    ];
    eventually("both deliveries", || log_b.lock().unwrap().len() == 2).await;
    assert_eq!(*log_a.lock().unwrap(), expected);
    assert_eq!(*log_b.lock().unwrap(), expected);
}

#[tokio::test]
async fn test_all_nodes_deliver_identical_sequence() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob"), config(3, "carol")]);
    let logs: Vec<_> = mesh.nodes.iter().map(|n| record_deliveries(n)).collect();

    let room = propose(mesh.node("alice"), 3, 1).await;
    eventually("everyone to see the room", || {
        mesh.nodes.iter().all(|n| n.room(&room).is_some())
    })
    .await;
    mesh.node("bob").call_local(Request::Join { room }).await;
    eventually("carol to see bob", || {
        mesh.node("carol").room(&room).unwrap().participants.len() == 2
    })
    .await;
    mesh.node("carol").call_local(Request::Join { room }).await;

    // Everyone chats at once
    let say = |name: &'static str, n: usize| {
        let node = Arc::clone(mesh.node(name));
        async move {
            for i in 0..n {
                node.call_local(Request::Say {
                    room,
                    text: format!("{} #{}", name, i),
                })
                .await;
            }
        }
    };
    tokio::join!(say("alice", 5), say("bob", 5), say("carol", 5));

    let total = |i: usize| logs[i].1.lock().unwrap().len();
    eventually("every node to deliver everything", || {
        // propose, two joins, start, fifteen lines of chat
        (0..3).all(|i| total(i) == 4 + 15)
    })
    .await;

    let reference = logs[0].1.lock().unwrap().clone();
    for (_, log) in &logs[1..] {
        assert_eq!(*log.lock().unwrap(), reference);
    }
    // Delivery order is the (timestamp, sender) order
    let mut sorted = reference.clone();
    sorted.sort_by_key(|(ts, sender, _)| (*ts, *sender));
    assert_eq!(reference, sorted);
}

// ============================================================================
// At-most-once
// ============================================================================

#[tokio::test]
async fn test_resubmitted_call_never_reexecutes() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");

    let room = propose(alice, 2, 1).await;
    eventually("bob to see the room", || bob.room(&room).is_some()).await;
    bob.call_local(Request::Join { room }).await;
    eventually("room to run", || room_state(bob, room) == Some(RoomState::Running)).await;

    // A front-end acting for bob submits the winning guess as (U, 5), twice
    let front_end = Caller::new(PeerId::from(0xf0), 1);
    let call = RemoteCall {
        caller: front_end,
        seq: 5,
        request: Request::Guess {
            room,
            guess: "alpha".into(),
        },
    };
    let first = bob.handle(call.clone()).await;
    let second = bob.handle(call).await;
    assert!(matches!(first, Reply::GuessSubmitted { .. }));
    assert_eq!(first, second);

    eventually("room to end", || room_state(alice, room) == Some(RoomState::Ended)).await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(mesh.scores.updates().len(), 1);
    assert_eq!(mesh.scores.get_score("bob").multiplayer, 1);
}

#[tokio::test]
async fn test_game_survives_duplicated_links() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    mesh.network.set_duplicate_calls(true);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");

    let room = propose(alice, 2, 1).await;
    eventually("bob to see the room", || bob.room(&room).is_some()).await;
    assert!(matches!(
        bob.call_local(Request::Join { room }).await,
        Reply::Joined { .. }
    ));
    eventually("room to run", || room_state(bob, room) == Some(RoomState::Running)).await;
    bob.call_local(Request::Guess {
        room,
        guess: "alpha".into(),
    })
    .await;

    eventually("room to end everywhere", || {
        mesh.nodes
            .iter()
            .all(|n| room_state(n, room) == Some(RoomState::Ended))
    })
    .await;
    sleep(Duration::from_millis(50)).await;
    assert_eq!(mesh.scores.updates().len(), 1);
}

#[tokio::test]
async fn test_restarted_caller_gets_fresh_window() {
    let mesh = Mesh::build(vec![config(1, "alice")]);
    let alice = mesh.node("alice");
    let peer = PeerId::from(0xf0);
    let call = |incarnation: u64, seq: u64| RemoteCall {
        caller: Caller::new(peer, incarnation),
        seq,
        request: Request::Status,
    };

    assert!(matches!(alice.handle(call(1, 10)).await, Reply::Status { .. }));
    assert_eq!(alice.handle(call(1, 3)).await, Reply::Duplicate { seq: 3 });

    // Process restarted and counts from 1 again
    assert!(matches!(alice.handle(call(2, 1)).await, Reply::Status { .. }));
    // Late traffic from the old process is stale
    assert_eq!(alice.handle(call(1, 11)).await, Reply::Duplicate { seq: 11 });
}

// ============================================================================
// Failure handling
// ============================================================================

#[tokio::test]
async fn test_failed_peer_is_evicted_and_unblocks_delivery() {
    let mesh = Mesh::build(vec![
        fast_failure(config(1, "alice")),
        fast_failure(config(2, "bob")),
        fast_failure(config(3, "carol")),
    ]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");
    let carol = mesh.node("carol");
    let failed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failed);
    let _sub = alice.events().subscribe(move |event| {
        if let MeshEvent::PeerFailed { peer_id } = event {
            sink.lock().unwrap().push(peer_id);
        }
    });

    let room = propose(alice, 3, 1).await;
    eventually("bob to see the room", || bob.room(&room).is_some()).await;

    // Carol vanishes; bob's join cannot reach total order until she is evicted
    mesh.network.set_down(carol.id(), true);
    let started = Instant::now();
    let reply = bob.call_local(Request::Join { room }).await;
    assert!(matches!(reply, Reply::Joined { .. }), "got {:?}", reply);
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(!bob.peer_ids().contains(&carol.id()));

    eventually("alice to evict carol", || {
        *failed.lock().unwrap() == vec![carol.id()]
    })
    .await;
    assert!(!alice.peer_ids().contains(&carol.id()));
    eventually("alice to drain", || alice.pending_messages() == 0).await;
    assert_eq!(room_state(alice, room), Some(RoomState::Pending));
    assert_eq!(alice.room(&room).unwrap().participants.len(), 2);
}

#[tokio::test]
async fn test_brief_outage_does_not_stall_order() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob"), config(3, "carol")]);
    let alice = mesh.node("alice");
    let carol = mesh.node("carol");

    // Carol drops off while alice proposes, then comes back well before
    // anyone would evict her
    mesh.network.set_down(carol.id(), true);
    let network = Arc::clone(&mesh.network);
    let carol_id = carol.id();
    tokio::spawn(async move {
        sleep(Duration::from_millis(300)).await;
        network.set_down(carol_id, false);
    });

    let room = propose(alice, 3, 1).await;
    eventually("everyone to see the room", || {
        mesh.nodes.iter().all(|n| n.room(&room).is_some())
    })
    .await;
    assert!(alice.peer_ids().contains(&carol.id()));

    // Later broadcasts from other senders still reach total order
    let reply = mesh.node("bob").call_local(Request::Join { room }).await;
    assert!(matches!(reply, Reply::Joined { .. }), "got {:?}", reply);
    eventually("every node to drain", || {
        mesh.nodes.iter().all(|n| n.pending_messages() == 0)
    })
    .await;
}

#[tokio::test]
async fn test_host_failure_ends_room() {
    let mesh = Mesh::build(vec![
        fast_failure(config(1, "alice")),
        fast_failure(config(2, "bob")),
    ]);
    let alice = mesh.node("alice");
    let bob = mesh.node("bob");

    let room = propose(alice, 3, 1).await;
    eventually("bob to see the room", || bob.room(&room).is_some()).await;
    bob.call_local(Request::Join { room }).await;

    mesh.network.set_down(alice.id(), true);
    eventually("bob to end the room", || {
        room_state(bob, room) == Some(RoomState::Ended)
    })
    .await;
    assert!(bob.room(&room).unwrap().winner.is_none());
    assert!(bob.peer_ids().is_empty());

    // Alone now, bob can host straight away
    let reply = bob
        .call_local(Request::Propose {
            capacity: 2,
            level: 1,
        })
        .await;
    assert!(
        matches!(reply, Reply::Proposed { room, .. } if room == bob.id()),
        "got {:?}",
        reply
    );
}

#[tokio::test]
async fn test_status_reports_peers_and_rooms() {
    let mesh = Mesh::build(vec![config(1, "alice"), config(2, "bob")]);
    let alice = mesh.node("alice");
    propose(alice, 2, 1).await;

    let status = match alice.call_local(Request::Status).await {
        Reply::Status { status } => status,
        other => panic!("unexpected {:?}", other),
    };
    assert_eq!(status.node_id, alice.id());
    assert_eq!(status.name, "alice");
    assert_eq!(status.peers.len(), 1);
    assert_eq!(status.peers[0].name, "bob");
    assert_eq!(status.rooms.len(), 1);
    assert!(status.clock >= 1);
}
