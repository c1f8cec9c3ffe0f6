//! Total-order reliable broadcast.
//!
//! Every node keeps a hold-back queue sorted by `(timestamp, sender_id)`.
//! An envelope leaves the queue only when it is at the head and every
//! participant known when it was queued has acknowledged it. Because each
//! receiver bumps its clock past the envelope's timestamp before acking, no
//! envelope with a smaller key can show up after the head is released, so
//! all nodes deliver the same sequence.
//!
//! The orderer is a plain state machine. The caller moves envelopes and acks
//! between nodes and must push outbound traffic while still holding whatever
//! lock guards the orderer, so per-link FIFO order matches stamp order.

use crate::clock::LogicalClock;
use crate::protocol::{Ack, Envelope, EventKind};
use crate::PeerId;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::debug;

type OrderKey = (u64, PeerId);

struct Pending {
    envelope: Envelope,
    acked_by: BTreeSet<PeerId>,
    expected: BTreeSet<PeerId>,
}

impl Pending {
    fn is_complete(&self) -> bool {
        self.expected.is_subset(&self.acked_by)
    }
}

/// A locally stamped envelope plus whatever it unblocked.
#[derive(Debug)]
pub struct Stamped {
    /// Envelope to fan out to every other participant
    pub envelope: Envelope,
    /// Envelopes delivered as a result, in order
    pub delivered: Vec<Envelope>,
}

/// Result of removing a participant.
#[derive(Debug, Default)]
pub struct Removed {
    /// Envelopes delivered as a result, in order
    pub delivered: Vec<Envelope>,
    /// The removed peer's envelopes still queued here
    pub relay: Vec<Envelope>,
}

/// Result of receiving a remote envelope.
#[derive(Debug, Default)]
pub struct Received {
    /// Acknowledgment to fan out; `None` for duplicates and unknown senders
    pub ack: Option<Ack>,
    /// Envelopes delivered as a result, in order
    pub delivered: Vec<Envelope>,
}

/// Hold-back queue and delivery bookkeeping for one node.
pub struct BroadcastOrderer {
    local_id: PeerId,
    local_name: String,
    clock: Arc<LogicalClock>,
    participants: BTreeSet<PeerId>,
    /// Removed participants whose envelopes may still arrive by relay
    departed: BTreeSet<PeerId>,
    queue: BTreeMap<OrderKey, Pending>,
    early_acks: HashMap<OrderKey, BTreeSet<PeerId>>,
    last_delivered: HashMap<PeerId, u64>,
}

impl BroadcastOrderer {
    pub fn new(local_id: PeerId, local_name: impl Into<String>, clock: Arc<LogicalClock>) -> Self {
        Self {
            local_id,
            local_name: local_name.into(),
            clock,
            participants: BTreeSet::from([local_id]),
            departed: BTreeSet::new(),
            queue: BTreeMap::new(),
            early_acks: HashMap::new(),
            last_delivered: HashMap::new(),
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// Start expecting acknowledgments from a peer for newly queued envelopes.
    pub fn add_participant(&mut self, peer_id: PeerId) -> bool {
        self.departed.remove(&peer_id);
        self.participants.insert(peer_id)
    }

    /// Stop waiting on a peer.
    ///
    /// Its outstanding acknowledgments are released, so envelopes blocked
    /// only on it become deliverable. Its own envelopes stay queued: another
    /// node may already have delivered them. They are returned in
    /// [`Removed::relay`] so the caller can pass them on to anyone who
    /// missed them.
    pub fn remove_participant(&mut self, peer_id: &PeerId) -> Removed {
        if *peer_id == self.local_id || !self.participants.remove(peer_id) {
            return Removed::default();
        }
        self.departed.insert(*peer_id);
        for pending in self.queue.values_mut() {
            pending.expected.remove(peer_id);
        }
        for ackers in self.early_acks.values_mut() {
            ackers.remove(peer_id);
        }
        self.early_acks.retain(|_, ackers| !ackers.is_empty());

        let delivered = self.drain();
        let relay = self
            .queue
            .values()
            .filter(|pending| pending.envelope.sender_id == *peer_id)
            .map(|pending| pending.envelope.clone())
            .collect();
        Removed { delivered, relay }
    }

    /// Stamp a local event and queue it, acknowledged by ourselves.
    pub fn stamp(&mut self, kind: EventKind, content: String) -> Stamped {
        let envelope = Envelope {
            timestamp: self.clock.tick(),
            sender_id: self.local_id,
            sender_name: self.local_name.clone(),
            kind,
            content,
        };
        self.queue.insert(
            envelope.order_key(),
            Pending {
                envelope: envelope.clone(),
                acked_by: BTreeSet::from([self.local_id]),
                expected: self.participants.clone(),
            },
        );
        debug!("Stamped {:?} at {}", envelope.kind, envelope.timestamp);
        Stamped {
            envelope,
            delivered: self.drain(),
        }
    }

    /// Accept an envelope from another participant, or one relayed on
    /// behalf of a removed participant.
    pub fn on_message(&mut self, envelope: Envelope) -> Received {
        self.clock.observe(envelope.timestamp);
        let key = envelope.order_key();
        let sender = envelope.sender_id;

        if sender == self.local_id {
            return Received::default();
        }
        if !self.is_known(&sender) {
            debug!("Ignoring message from non-participant {}", sender);
            return Received::default();
        }
        if self.is_stale(&key) || self.queue.contains_key(&key) {
            debug!("Ignoring duplicate message {}@{}", sender, envelope.timestamp);
            return Received::default();
        }

        let mut acked_by = BTreeSet::from([sender, self.local_id]);
        if let Some(early) = self.early_acks.remove(&key) {
            acked_by.extend(early);
        }
        self.queue.insert(
            key,
            Pending {
                envelope,
                acked_by,
                expected: self.participants.clone(),
            },
        );

        let ack = Ack {
            orig_sender_id: sender,
            orig_timestamp: key.0,
            acker_id: self.local_id,
            acker_timestamp: self.clock.tick(),
        };
        Received {
            ack: Some(ack),
            delivered: self.drain(),
        }
    }

    /// Record an acknowledgment, buffering it if its envelope has not arrived.
    pub fn on_ack(&mut self, ack: Ack) -> Vec<Envelope> {
        self.clock.observe(ack.acker_timestamp);
        if !self.participants.contains(&ack.acker_id) {
            return Vec::new();
        }
        let key = ack.target();
        let dropped = self.is_stale(&key) || !self.is_known(&key.1);
        match self.queue.get_mut(&key) {
            Some(pending) => {
                pending.acked_by.insert(ack.acker_id);
            }
            None if dropped => return Vec::new(),
            None => {
                self.early_acks.entry(key).or_default().insert(ack.acker_id);
                return Vec::new();
            }
        }
        self.drain()
    }

    fn is_known(&self, sender: &PeerId) -> bool {
        self.participants.contains(sender) || self.departed.contains(sender)
    }

    fn is_stale(&self, (timestamp, sender): &OrderKey) -> bool {
        self.last_delivered
            .get(sender)
            .is_some_and(|last| timestamp <= last)
    }

    /// Release complete envelopes from the head of the queue.
    fn drain(&mut self) -> Vec<Envelope> {
        let mut delivered = Vec::new();
        while let Some(entry) = self.queue.first_entry() {
            let (timestamp, sender) = *entry.key();
            let stale = self
                .last_delivered
                .get(&sender)
                .is_some_and(|last| timestamp <= *last);
            if stale {
                entry.remove();
                continue;
            }
            if !entry.get().is_complete() {
                break;
            }
            let pending = entry.remove();
            self.last_delivered.insert(sender, timestamp);
            delivered.push(pending.envelope);
        }
        if !delivered.is_empty() {
            let last = &self.last_delivered;
            self.early_acks
                .retain(|(ts, sender), _| last.get(sender).is_none_or(|l| ts > l));
        }
        delivered
    }

    /// Envelopes waiting in the hold-back queue.
    pub fn pending_len(&self) -> usize {
        self.queue.len()
    }

    pub fn participants(&self) -> &BTreeSet<PeerId> {
        &self.participants
    }

    /// Timestamp of the last envelope delivered from a sender.
    pub fn last_delivered(&self, sender: &PeerId) -> Option<u64> {
        self.last_delivered.get(sender).copied()
    }

    /// Peers whose acknowledgment the head of the queue still waits for.
    pub fn head_waiting_on(&self) -> Vec<PeerId> {
        self.queue
            .values()
            .next()
            .map(|p| p.expected.difference(&p.acked_by).copied().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> PeerId {
        PeerId::from(n)
    }

    fn orderer(n: u64, peers: &[u64]) -> BroadcastOrderer {
        let mut orderer = BroadcastOrderer::new(id(n), format!("p{}", n), Arc::new(LogicalClock::new()));
        for p in peers {
            orderer.add_participant(id(*p));
        }
        orderer
    }

    fn keys(envelopes: &[Envelope]) -> Vec<(u64, PeerId)> {
        envelopes.iter().map(Envelope::order_key).collect()
    }

    // ==================== Single node ====================

    #[test]
    fn test_alone_delivers_immediately() {
        let mut a = orderer(1, &[]);
        let stamped = a.stamp(EventKind::Text, "hi".into());
        assert_eq!(stamped.envelope.timestamp, 1);
        assert_eq!(keys(&stamped.delivered), vec![(1, id(1))]);
        assert_eq!(a.pending_len(), 0);
    }

    // ==================== Two nodes ====================

    #[test]
    fn test_sender_waits_for_ack() {
        let mut a = orderer(1, &[2]);
        let mut b = orderer(2, &[1]);

        let stamped = a.stamp(EventKind::Text, "hi".into());
        assert!(stamped.delivered.is_empty());
        assert_eq!(a.head_waiting_on(), vec![id(2)]);

        let received = b.on_message(stamped.envelope);
        assert_eq!(keys(&received.delivered), vec![(1, id(1))]);

        let ack = received.ack.unwrap();
        assert!(ack.acker_timestamp > 1);
        assert_eq!(keys(&a.on_ack(ack)), vec![(1, id(1))]);
    }

    #[test]
    fn test_equal_timestamps_tie_break_by_sender() {
        let mut a = orderer(1, &[2]);
        let mut b = orderer(2, &[1]);

        let from_a = a.stamp(EventKind::Text, "a".into()).envelope;
        let from_b = b.stamp(EventKind::Text, "b".into()).envelope;
        assert_eq!(from_a.timestamp, from_b.timestamp);

        let at_b = b.on_message(from_a);
        let at_a = a.on_message(from_b);

        let mut seen_b = at_b.delivered;
        let mut seen_a = at_a.delivered;
        seen_a.extend(a.on_ack(at_b.ack.unwrap()));
        seen_b.extend(b.on_ack(at_a.ack.unwrap()));

        let expected = vec![(1, id(1)), (1, id(2))];
        assert_eq!(keys(&seen_a), expected);
        assert_eq!(keys(&seen_b), expected);
    }

    #[test]
    fn test_early_ack_is_buffered() {
        let mut a = orderer(1, &[2, 3]);
        let mut b = orderer(2, &[1, 3]);
        let mut c = orderer(3, &[1, 2]);

        let env = a.stamp(EventKind::Text, "x".into()).envelope;
        let ack_b = b.on_message(env.clone()).ack.unwrap();

        // b's ack reaches c before a's message does
        assert!(c.on_ack(ack_b).is_empty());
        let received = c.on_message(env);
        assert_eq!(keys(&received.delivered), vec![(1, id(1))]);
    }

    #[test]
    fn test_duplicate_message_not_acked_twice() {
        let mut a = orderer(1, &[2]);
        let mut b = orderer(2, &[1]);

        let env = a.stamp(EventKind::Text, "x".into()).envelope;
        assert!(b.on_message(env.clone()).ack.is_some());
        let again = b.on_message(env);
        assert!(again.ack.is_none());
        assert!(again.delivered.is_empty());
    }

    #[test]
    fn test_stale_message_discarded() {
        let mut a = orderer(1, &[2]);
        let mut b = orderer(2, &[1]);

        let first = a.stamp(EventKind::Text, "1".into()).envelope;
        let second = a.stamp(EventKind::Text, "2".into()).envelope;
        b.on_message(second);
        assert_eq!(b.last_delivered(&id(1)), Some(2));

        // Older envelope from the same sender arriving after a newer delivery
        let late = b.on_message(first);
        assert!(late.ack.is_none());
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_unknown_sender_ignored() {
        let mut a = orderer(1, &[]);
        let mut stranger = orderer(9, &[1]);
        let env = stranger.stamp(EventKind::Text, "?".into()).envelope;
        let received = a.on_message(env);
        assert!(received.ack.is_none());
        assert_eq!(a.pending_len(), 0);
    }

    #[test]
    fn test_higher_timestamp_held_behind_lower() {
        let mut a = orderer(1, &[2, 3]);
        let mut b = orderer(2, &[1, 3]);
        let mut c = orderer(3, &[1, 2]);

        let low = a.stamp(EventKind::Text, "low".into()).envelope; // (1, a)
        for _ in 0..3 {
            b.stamp(EventKind::Text, "warmup".into());
        }
        let high = b.stamp(EventKind::Text, "high".into()).envelope; // (4, b)

        // c has both; high is fully acked first but must wait for low
        let recv_low = c.on_message(low.clone());
        let recv_high = c.on_message(high.clone());
        assert!(recv_low.delivered.is_empty());
        assert!(recv_high.delivered.is_empty());

        // a acks high, so high is complete at c but low still lacks b's ack
        a.on_message(high);
        let ack_a_high = Ack {
            orig_sender_id: id(2),
            orig_timestamp: 4,
            acker_id: id(1),
            acker_timestamp: 10,
        };
        assert!(c.on_ack(ack_a_high).is_empty());

        let ack_b_low = b.on_message(low).ack.unwrap();
        let delivered = c.on_ack(ack_b_low);
        assert_eq!(keys(&delivered)[0], (1, id(1)));
    }

    // ==================== Membership changes ====================

    #[test]
    fn test_removing_participant_releases_ack() {
        let mut a = orderer(1, &[2, 3]);
        let mut b = orderer(2, &[1, 3]);

        let env = a.stamp(EventKind::Text, "x".into()).envelope;
        let ack_b = b.on_message(env).ack.unwrap();
        assert!(a.on_ack(ack_b).is_empty());
        assert_eq!(a.head_waiting_on(), vec![id(3)]);

        let removed = a.remove_participant(&id(3));
        assert_eq!(keys(&removed.delivered), vec![(1, id(1))]);
        assert!(removed.relay.is_empty());
    }

    #[test]
    fn test_failed_senders_message_delivered_everywhere() {
        let mut a = orderer(1, &[2, 3]);
        let mut b = orderer(2, &[1, 3]);
        let mut c = orderer(3, &[1, 2]);

        let from_c = c.stamp(EventKind::Text, "last words".into()).envelope;
        let ack_a = a.on_message(from_c.clone()).ack.unwrap();
        let ack_b = b.on_message(from_c).ack.unwrap();

        // a hears from b and delivers before anyone notices c is gone
        assert_eq!(keys(&a.on_ack(ack_b)), vec![(1, id(3))]);

        // b drops c, then a's ack arrives late
        let removed = b.remove_participant(&id(3));
        assert!(removed.delivered.is_empty());
        assert_eq!(keys(&removed.relay), vec![(1, id(3))]);
        assert_eq!(keys(&b.on_ack(ack_a)), vec![(1, id(3))]);
        assert_eq!(b.pending_len(), 0);
    }

    #[test]
    fn test_relayed_message_from_failed_sender_accepted() {
        let mut a = orderer(1, &[2, 3]);
        let mut b = orderer(2, &[1, 3]);
        let mut c = orderer(3, &[1, 2]);

        // c reached a but crashed before reaching b
        let from_c = c.stamp(EventKind::Text, "half sent".into()).envelope;
        a.on_message(from_c);
        let relay = a.remove_participant(&id(3)).relay;
        assert_eq!(keys(&relay), vec![(1, id(3))]);

        b.remove_participant(&id(3));
        let received = b.on_message(relay[0].clone());
        let ack_b = received.ack.unwrap();
        assert!(received.delivered.is_empty());
        assert_eq!(keys(&a.on_ack(ack_b)), vec![(1, id(3))]);
    }

    #[test]
    fn test_early_ack_for_unknown_sender_not_buffered() {
        let mut a = orderer(1, &[2]);
        let stray = Ack {
            orig_sender_id: id(9),
            orig_timestamp: 4,
            acker_id: id(2),
            acker_timestamp: 5,
        };
        assert!(a.on_ack(stray).is_empty());
        assert!(a.early_acks.is_empty());
    }

    #[test]
    fn test_stale_early_acks_pruned_on_delivery() {
        let mut a = orderer(1, &[2, 3]);
        let mut b = orderer(2, &[1, 3]);

        let first = b.stamp(EventKind::Text, "1".into()).envelope;
        let second = b.stamp(EventKind::Text, "2".into()).envelope;
        // c acked the first, which a never receives before the second
        a.on_ack(Ack {
            orig_sender_id: id(2),
            orig_timestamp: first.timestamp,
            acker_id: id(3),
            acker_timestamp: 3,
        });
        assert_eq!(a.early_acks.len(), 1);

        a.on_message(second.clone());
        a.on_ack(Ack {
            orig_sender_id: id(2),
            orig_timestamp: second.timestamp,
            acker_id: id(3),
            acker_timestamp: 4,
        });
        assert_eq!(a.last_delivered(&id(2)), Some(second.timestamp));
        assert!(a.early_acks.is_empty());
    }

    #[test]
    fn test_cannot_remove_self() {
        let mut a = orderer(1, &[2]);
        assert!(a.remove_participant(&id(1)).delivered.is_empty());
        assert!(a.participants().contains(&id(1)));
    }

    #[test]
    fn test_ack_from_non_participant_ignored() {
        let mut a = orderer(1, &[2]);
        a.stamp(EventKind::Text, "x".into());
        let bogus = Ack {
            orig_sender_id: id(1),
            orig_timestamp: 1,
            acker_id: id(7),
            acker_timestamp: 2,
        };
        assert!(a.on_ack(bogus).is_empty());
        assert_eq!(a.head_waiting_on(), vec![id(2)]);
    }
}
