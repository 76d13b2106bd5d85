//! Gossip Sync Manager
//!
//! Anti-entropy for the mesh: every peer eventually learns every recent
//! broadcast message and every peer's latest announcement, with no
//! per-peer history tracking. Each round a node broadcasts a
//! `REQUEST_SYNC` carrying a Bloom sketch of its seen-set; neighbors
//! replay the stored packets the sketch lacks, unicast with ttl=0 so the
//! gap-fill never re-floods.
//!
//! The sketch gives false positives but no false negatives for the
//! requester's own inserts, so a neighbor never replays something the
//! requester already has; it may (with probability at most the FPR)
//! withhold something missing, which the next round repairs.
//!
//! Storage is deliberately small: a bounded FIFO of recent broadcasts
//! (default 100) and the latest announcement per sender. With 30-second
//! rounds that is the effective replay window; older traffic is
//! intentionally forgotten.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::bloom::{BloomSnapshot, SeenFilter};
use crate::wire::sync::SyncRequest;
use crate::wire::{kind, Packet};

/// Default cap on stored broadcast messages.
pub const DEFAULT_MESSAGE_CAP: usize = 100;

/// Delay before the extra targeted sync to a newly appeared peer.
pub const NEW_PEER_SYNC_DELAY_SECS: u64 = 5;

/// Scheduling leeway for the periodic sync timer.
pub const SYNC_TIMER_LEEWAY_SECS: u64 = 1;

/// The gossip sync manager.
///
/// Owns the broadcast FIFO and announce map exclusively, and is the only
/// mutator of the shared seen filter.
pub struct GossipSyncManager {
    /// Insertion-ordered recent broadcasts: (fingerprint hex, packet).
    messages: VecDeque<(String, Packet)>,
    /// Latest announcement per sender: sender hex -> (fingerprint hex, packet).
    latest_announcement: HashMap<String, (String, Packet)>,
    /// Shared seen-set; snapshots ship in sync requests.
    seen: Arc<SeenFilter>,
    /// Broadcast FIFO cap.
    message_cap: usize,
}

impl GossipSyncManager {
    /// Create a manager over a shared seen filter.
    pub fn new(seen: Arc<SeenFilter>) -> Self {
        Self::with_capacity(seen, DEFAULT_MESSAGE_CAP)
    }

    /// Create a manager with an explicit broadcast cap.
    pub fn with_capacity(seen: Arc<SeenFilter>, message_cap: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            latest_announcement: HashMap::new(),
            seen,
            message_cap,
        }
    }

    /// Dedup gate + storage for an incoming packet.
    ///
    /// Records the fingerprint in the seen filter; returns false when the
    /// packet was already observed (first arrival wins, later copies
    /// drop). Broadcast messages and announcements are additionally
    /// stored for replay.
    pub fn observe(&mut self, packet: &Packet) -> bool {
        let fingerprint = packet.fingerprint();
        if !self.seen.observe(&fingerprint) {
            trace!(fp = %fingerprint, "Duplicate packet dropped");
            return false;
        }
        self.store(packet, fingerprint.to_hex());
        true
    }

    /// Store a public packet without the dedup gate (used for packets this
    /// node originated, which are already known-new).
    pub fn record_own(&mut self, packet: &Packet) {
        let fingerprint = packet.fingerprint();
        self.seen.insert(&fingerprint);
        self.store(packet, fingerprint.to_hex());
    }

    fn store(&mut self, packet: &Packet, fingerprint_hex: String) {
        match packet.kind {
            kind::MESSAGE if packet.is_broadcast() => {
                if self.messages.len() >= self.message_cap {
                    self.messages.pop_front();
                }
                self.messages.push_back((fingerprint_hex, packet.clone()));
            }
            kind::ANNOUNCE => {
                let sender = hex::encode(packet.sender_id);
                self.latest_announcement
                    .insert(sender, (fingerprint_hex, packet.clone()));
            }
            _ => {}
        }
    }

    /// Build the periodic `REQUEST_SYNC` packet.
    ///
    /// Carries the active Bloom snapshot; ttl=0 keeps it local to direct
    /// neighbors. `recipient` targets the extra sync sent shortly after a
    /// peer first appears.
    pub fn build_sync_request(
        &self,
        sender_id: [u8; 8],
        recipient: Option<[u8; 8]>,
        timestamp_ms: u64,
    ) -> Packet {
        let snapshot = self.seen.snapshot();
        let request = SyncRequest {
            m_bytes: snapshot.m_bytes,
            k: snapshot.k,
            bits: snapshot.bits,
        };
        let payload = request.encode();
        match recipient {
            Some(recipient) => {
                Packet::unicast(kind::REQUEST_SYNC, 0, timestamp_ms, sender_id, recipient, payload)
            }
            None => Packet::broadcast(kind::REQUEST_SYNC, 0, timestamp_ms, sender_id, payload),
        }
    }

    /// Service a peer's `REQUEST_SYNC`.
    ///
    /// Reconstructs the requester's membership predicate and returns the
    /// stored packets it likely lacks, announcements first, then
    /// broadcasts in insertion order, every clone with ttl=0 for unicast
    /// replay to the requester.
    pub fn serve_sync_request(&self, request: &SyncRequest) -> Vec<Packet> {
        let sketch = BloomSnapshot::from_parts(request.m_bytes, request.k, request.bits.clone());
        let mut replay = Vec::new();

        for (fingerprint_hex, packet) in self.latest_announcement.values() {
            if !sketch_contains(&sketch, fingerprint_hex) {
                replay.push(packet.clone_local());
            }
        }

        for (fingerprint_hex, packet) in &self.messages {
            if !sketch_contains(&sketch, fingerprint_hex) {
                replay.push(packet.clone_local());
            }
        }

        debug!(
            replayed = replay.len(),
            stored_messages = self.messages.len(),
            stored_announcements = self.latest_announcement.len(),
            "Served sync request"
        );
        replay
    }

    /// Number of stored broadcasts.
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// Number of stored announcements.
    pub fn announcement_count(&self) -> usize {
        self.latest_announcement.len()
    }

    /// Reset storage and the seen filter (panic wipe).
    pub fn wipe(&mut self) {
        self.messages.clear();
        self.latest_announcement.clear();
        self.seen.reset();
    }
}

/// Query a sketch with a fingerprint stored as hex.
fn sketch_contains(sketch: &BloomSnapshot, fingerprint_hex: &str) -> bool {
    let Ok(bytes) = hex::decode(fingerprint_hex) else {
        return false;
    };
    let Ok(bytes) = <[u8; 16]>::try_from(bytes) else {
        return false;
    };
    sketch.might_contain(&crate::wire::Fingerprint::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::sync::SyncRequest;

    fn make_manager() -> GossipSyncManager {
        GossipSyncManager::new(Arc::new(SeenFilter::new()))
    }

    fn broadcast_message(sender: u8, seq: u64) -> Packet {
        Packet::broadcast(
            kind::MESSAGE,
            7,
            1_700_000_000_000 + seq,
            [sender; 8],
            format!("msg-{}", seq).into_bytes(),
        )
    }

    fn announce(sender: u8, seq: u64) -> Packet {
        Packet::broadcast(
            kind::ANNOUNCE,
            7,
            1_700_000_000_000 + seq,
            [sender; 8],
            format!("announce-{}", seq).into_bytes(),
        )
    }

    #[test]
    fn test_observe_dedups_second_arrival() {
        let mut manager = make_manager();
        let packet = broadcast_message(1, 0);

        assert!(manager.observe(&packet));
        assert!(!manager.observe(&packet));
        assert_eq!(manager.message_count(), 1);
    }

    #[test]
    fn test_relayed_copy_with_lower_ttl_still_dedups() {
        let mut manager = make_manager();
        let packet = broadcast_message(1, 0);
        assert!(manager.observe(&packet));

        let mut relayed = packet.clone();
        relayed.ttl = 3;
        assert!(!manager.observe(&relayed));
    }

    #[test]
    fn test_message_fifo_evicts_oldest() {
        let mut manager =
            GossipSyncManager::with_capacity(Arc::new(SeenFilter::new()), 3);
        for seq in 0..5 {
            manager.observe(&broadcast_message(1, seq));
        }
        assert_eq!(manager.message_count(), 3);
        // Oldest two evicted; a sketch missing everything gets 2..5 back
        let empty = SyncRequest {
            m_bytes: 256,
            k: 7,
            bits: vec![0; 256],
        };
        let replay = manager.serve_sync_request(&empty);
        let payloads: Vec<_> = replay
            .iter()
            .map(|p| String::from_utf8_lossy(&p.payload).into_owned())
            .collect();
        assert_eq!(payloads, vec!["msg-2", "msg-3", "msg-4"]);
    }

    #[test]
    fn test_announce_overwrites_per_sender() {
        let mut manager = make_manager();
        manager.observe(&announce(1, 0));
        manager.observe(&announce(1, 1));
        manager.observe(&announce(2, 2));

        assert_eq!(manager.announcement_count(), 2);
    }

    #[test]
    fn test_private_and_unknown_kinds_not_stored() {
        let mut manager = make_manager();
        let private = Packet::unicast(
            kind::MESSAGE,
            7,
            1_700_000_000_000,
            [1; 8],
            [2; 8],
            b"private".to_vec(),
        );
        assert!(manager.observe(&private));
        let ack = Packet::unicast(
            kind::DELIVERY_ACK,
            7,
            1_700_000_000_001,
            [1; 8],
            [2; 8],
            b"mid".to_vec(),
        );
        assert!(manager.observe(&ack));

        assert_eq!(manager.message_count(), 0);
        assert_eq!(manager.announcement_count(), 0);
    }

    #[test]
    fn test_sync_request_is_local_only() {
        let manager = make_manager();
        let request = manager.build_sync_request([9; 8], None, 1_700_000_000_000);
        assert_eq!(request.kind, kind::REQUEST_SYNC);
        assert_eq!(request.ttl, 0);
        assert!(request.is_broadcast());

        let targeted = manager.build_sync_request([9; 8], Some([3; 8]), 1_700_000_000_000);
        assert_eq!(targeted.recipient_id, Some([3; 8]));
        assert_eq!(targeted.ttl, 0);
    }

    #[test]
    fn test_sync_request_roundtrips_through_codec() {
        let mut manager = make_manager();
        manager.observe(&broadcast_message(1, 0));

        let request = manager.build_sync_request([9; 8], None, 1_700_000_000_000);
        let decoded = SyncRequest::decode(&request.payload).unwrap();
        assert_eq!(decoded.m_bytes, 256);
        assert_eq!(decoded.bits.len(), 256);
    }

    #[test]
    fn test_serve_skips_what_requester_has() {
        let mut alice = make_manager();
        let mut bob = make_manager();

        let shared = broadcast_message(1, 0);
        let only_alice = broadcast_message(2, 1);
        alice.observe(&shared);
        alice.observe(&only_alice);
        bob.observe(&shared);

        // Bob requests; Alice replays only what Bob's sketch lacks
        let request = bob.build_sync_request([2; 8], None, 1_700_000_000_000);
        let decoded = SyncRequest::decode(&request.payload).unwrap();
        let replay = alice.serve_sync_request(&decoded);

        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].payload, only_alice.payload);
        assert_eq!(replay[0].ttl, 0);
    }

    #[test]
    fn test_serve_orders_announcements_before_broadcasts() {
        let mut manager = make_manager();
        manager.observe(&broadcast_message(1, 0));
        manager.observe(&announce(1, 1));
        manager.observe(&broadcast_message(1, 2));

        let empty = SyncRequest {
            m_bytes: 256,
            k: 7,
            bits: vec![0; 256],
        };
        let replay = manager.serve_sync_request(&empty);
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].kind, kind::ANNOUNCE);
        assert_eq!(replay[1].kind, kind::MESSAGE);
        assert_eq!(replay[2].kind, kind::MESSAGE);
        // Broadcasts keep insertion order
        assert_eq!(replay[1].payload, b"msg-0");
        assert_eq!(replay[2].payload, b"msg-2");
    }

    #[test]
    fn test_gap_fill_converges_over_rounds() {
        let mut alice = make_manager();
        let mut bob = make_manager();

        for seq in 0..10 {
            alice.observe(&broadcast_message(1, seq));
        }

        // Round: Bob requests, Alice serves, Bob ingests the replay
        let request = bob.build_sync_request([2; 8], None, 1_700_000_000_000);
        let decoded = SyncRequest::decode(&request.payload).unwrap();
        for packet in alice.serve_sync_request(&decoded) {
            bob.observe(&packet);
        }
        assert_eq!(bob.message_count(), 10);

        // Next round: nothing left to replay
        let request = bob.build_sync_request([2; 8], None, 1_700_000_030_000);
        let decoded = SyncRequest::decode(&request.payload).unwrap();
        assert!(alice.serve_sync_request(&decoded).is_empty());
    }

    #[test]
    fn test_wipe_clears_storage_and_filter() {
        let mut manager = make_manager();
        let packet = broadcast_message(1, 0);
        manager.observe(&packet);
        manager.wipe();

        assert_eq!(manager.message_count(), 0);
        assert_eq!(manager.announcement_count(), 0);
        // After the wipe the same packet is new again
        assert!(manager.observe(&packet));
    }
}
