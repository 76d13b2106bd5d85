use super::*;
use crate::config::{OverlayConfig, PolicyConfig};
use crate::mesh::{MeshError, ReadReceipt};
use crate::overlay::relay::RelayDirectory;
use crate::overlay::{OverlayError, RelaySink, SubscriptionFilter};
use std::collections::HashSet;
use std::sync::Mutex;

// ===== Test doubles =====

#[derive(Default)]
struct MockMesh {
    reachable: Mutex<HashSet<String>>,
    acks: Mutex<Vec<(String, String)>>,
    receipts: Mutex<Vec<(String, String)>>,
    packets: Mutex<Vec<(Packet, Option<String>)>>,
    private_sends: Mutex<Vec<(String, String)>>,
}

impl MockMesh {
    fn set_reachable(&self, peer: &PeerId) {
        self.reachable
            .lock()
            .unwrap()
            .insert(peer.short_hex().unwrap());
    }
}

impl MeshTransport for MockMesh {
    fn my_peer_id(&self) -> PeerId {
        PeerId::Short([0xee; 8])
    }

    fn is_peer_reachable(&self, peer: &PeerId) -> bool {
        peer.short_hex()
            .map(|key| self.reachable.lock().unwrap().contains(&key))
            .unwrap_or(false)
    }

    fn is_peer_connected(&self, peer: &PeerId) -> bool {
        self.is_peer_reachable(peer)
    }

    fn send_private_message(
        &self,
        content: &str,
        to: &PeerId,
        _nickname: &str,
        _message_id: &str,
    ) -> Result<(), MeshError> {
        self.private_sends
            .lock()
            .unwrap()
            .push((content.to_string(), to.to_string()));
        Ok(())
    }

    fn send_read_receipt(&self, receipt: &ReadReceipt, to: &PeerId) -> Result<(), MeshError> {
        self.receipts
            .lock()
            .unwrap()
            .push((receipt.message_id.clone(), to.to_string()));
        Ok(())
    }

    fn send_delivery_ack(&self, message_id: &str, to: &PeerId) -> Result<(), MeshError> {
        self.acks
            .lock()
            .unwrap()
            .push((message_id.to_string(), to.to_string()));
        Ok(())
    }

    fn send_favorite_notification(&self, _to: &PeerId, _is_favorite: bool) -> Result<(), MeshError> {
        Ok(())
    }

    fn send_file_transfer(
        &self,
        _payload: &[u8],
        _recipient: Option<&PeerId>,
        _transfer_id: &str,
        _message_id: &str,
    ) -> Result<(), MeshError> {
        Ok(())
    }

    fn sign_packet_for_broadcast(&self, mut packet: Packet) -> Packet {
        packet.signature = Some(vec![0xcd; 64]);
        packet
    }

    fn send_packet(&self, packet: Packet, to: Option<&PeerId>) -> Result<(), MeshError> {
        self.packets
            .lock()
            .unwrap()
            .push((packet, to.map(|p| p.to_string())));
        Ok(())
    }
}

#[derive(Default)]
struct NullSink;

impl RelaySink for NullSink {
    fn publish(&self, _relays: &[String], _event: &OverlayEvent) -> Result<(), OverlayError> {
        Ok(())
    }

    fn subscribe(
        &self,
        _subscription_id: &str,
        _relays: &[String],
        _filter: &SubscriptionFilter,
    ) -> Result<(), OverlayError> {
        Ok(())
    }

    fn unsubscribe(&self, _subscription_id: &str) {}
}

struct Fixture {
    mesh: Arc<MockMesh>,
    node: Node,
    app_rx: mpsc::UnboundedReceiver<AppEvent>,
}

fn fixture_with_config(config: Config) -> Fixture {
    let mesh = Arc::new(MockMesh::default());
    let proxy = Arc::new(ProxyManager::new(
        &OverlayConfig::default(),
        &PolicyConfig { fail_closed: true },
    ));
    let overlay = Arc::new(
        OverlayTransport::new(
            proxy.clone(),
            Arc::new(NullSink) as Arc<dyn RelaySink>,
            RelayDirectory::embedded(),
            5,
            config.pow.clone(),
            [33u8; 32],
        )
        .unwrap(),
    );
    let favorites = Arc::new(Favorites::new());
    let (node, app_rx) = Node::new(
        config,
        mesh.clone(),
        overlay,
        proxy,
        favorites,
        ReceiptLedger::ephemeral(),
        BookmarkStore::ephemeral(),
    );
    Fixture { mesh, node, app_rx }
}

fn fixture() -> Fixture {
    fixture_with_config(Config::default())
}

fn broadcast_message(sender: u8, seq: u64, content: &str) -> Packet {
    Packet::broadcast(
        kind::MESSAGE,
        7,
        1_700_000_000_000 + seq,
        [sender; 8],
        content.as_bytes().to_vec(),
    )
}

fn private_message(sender: u8, body: &PrivateMessageBody) -> Packet {
    Packet::unicast(
        kind::MESSAGE,
        7,
        1_700_000_000_500,
        [sender; 8],
        [0xee; 8],
        serde_json::to_vec(body).unwrap(),
    )
}

// ===== Ingress pipeline =====

#[test]
fn test_broadcast_message_delivered_once() {
    let mut fx = fixture();
    let packet = broadcast_message(1, 0, "hello mesh");

    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet.clone()));
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));

    match fx.app_rx.try_recv().unwrap() {
        AppEvent::PublicMessage { from, content, .. } => {
            assert_eq!(from, PeerId::Short([1; 8]));
            assert_eq!(content, "hello mesh");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // Second arrival was a duplicate
    assert!(fx.app_rx.try_recv().is_err());
    assert_eq!(fx.node.stats().dropped_duplicate, 1);
}

#[test]
fn test_private_message_acked_and_delivered() {
    let mut fx = fixture();
    let sender = PeerId::Short([1; 8]);
    fx.mesh.set_reachable(&sender);

    let body = PrivateMessageBody {
        content: "psst".to_string(),
        nickname: "alice".to_string(),
        message_id: "mid-1".to_string(),
    };
    fx.node
        .handle_mesh_event(MeshEvent::PacketDecoded(private_message(1, &body)));

    match fx.app_rx.try_recv().unwrap() {
        AppEvent::PrivateMessage {
            content,
            nickname,
            message_id,
            ..
        } => {
            assert_eq!(content, "psst");
            assert_eq!(nickname, "alice");
            assert_eq!(message_id, "mid-1");
        }
        other => panic!("unexpected event: {:?}", other),
    }
    // Delivery ack went back over the mesh
    let acks = fx.mesh.acks.lock().unwrap();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].0, "mid-1");
}

#[test]
fn test_private_message_for_other_recipient_ignored() {
    let mut fx = fixture();
    let mut packet = private_message(
        1,
        &PrivateMessageBody {
            content: "x".into(),
            nickname: "n".into(),
            message_id: "m".into(),
        },
    );
    packet.recipient_id = Some([0x99; 8]);

    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));
    assert!(fx.app_rx.try_recv().is_err());
}

#[test]
fn test_rate_limited_sender_dropped() {
    let config = Config::from_json(
        r#"{"ingress": {"sender_burst": 2, "sender_refill_rate": 0.0}}"#,
    )
    .unwrap();
    let mut fx = fixture_with_config(config);

    for seq in 0..5 {
        let packet = broadcast_message(1, seq, &format!("msg-{}", seq));
        fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));
    }

    assert_eq!(fx.node.stats().dropped_rate_limited, 3);
    let mut delivered = 0;
    while fx.app_rx.try_recv().is_ok() {
        delivered += 1;
    }
    assert_eq!(delivered, 2);
}

#[test]
fn test_malformed_file_transfer_dropped() {
    let mut fx = fixture();
    let packet = Packet::broadcast(
        kind::FILE_TRANSFER,
        7,
        1_700_000_000_000,
        [1; 8],
        vec![0x7f, 0x00],
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));

    assert_eq!(fx.node.stats().dropped_malformed, 1);
    assert!(fx.app_rx.try_recv().is_err());
}

// ===== Sync serving =====

#[test]
fn test_sync_request_replayed_unicast_to_requester() {
    let mut fx = fixture();
    fx.node
        .handle_mesh_event(MeshEvent::PacketDecoded(broadcast_message(1, 0, "stored")));

    // Requester with an empty sketch
    let request = SyncRequest {
        m_bytes: 256,
        k: 7,
        bits: vec![0; 256],
    };
    let packet = Packet::broadcast(
        kind::REQUEST_SYNC,
        0,
        1_700_000_001_000,
        [2; 8],
        request.encode(),
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));

    let packets = fx.mesh.packets.lock().unwrap();
    assert_eq!(packets.len(), 1);
    let (replayed, to) = &packets[0];
    assert_eq!(replayed.payload, b"stored");
    assert_eq!(replayed.ttl, 0);
    assert_eq!(to.as_deref(), Some(hex::encode([2u8; 8]).as_str()));
    drop(packets);
    assert_eq!(fx.node.stats().sync_served, 1);
}

#[test]
fn test_own_broadcast_joins_replay_window() {
    let mut fx = fixture();
    fx.node.send_public("from me").unwrap();

    let request = SyncRequest {
        m_bytes: 256,
        k: 7,
        bits: vec![0; 256],
    };
    let packet = Packet::broadcast(
        kind::REQUEST_SYNC,
        0,
        1_700_000_001_000,
        [2; 8],
        request.encode(),
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));

    let packets = fx.mesh.packets.lock().unwrap();
    // First entry is our own broadcast, second the replay
    assert_eq!(packets.len(), 2);
    assert_eq!(packets[1].0.payload, b"from me");
    assert_eq!(packets[1].0.ttl, 0);
}

// ===== Delivery status =====

#[test]
fn test_ack_packets_advance_status_monotonically() {
    let mut fx = fixture();

    let read = Packet::unicast(
        kind::READ_RECEIPT,
        7,
        1_700_000_000_100,
        [1; 8],
        [0xee; 8],
        b"mid-1".to_vec(),
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(read));
    assert_eq!(
        fx.node.router().delivery_status("mid-1"),
        Some(DeliveryStatus::Read)
    );

    // A late delivery ack must not downgrade
    let delivered = Packet::unicast(
        kind::DELIVERY_ACK,
        7,
        1_700_000_000_200,
        [1; 8],
        [0xee; 8],
        b"mid-1".to_vec(),
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(delivered));
    assert_eq!(
        fx.node.router().delivery_status("mid-1"),
        Some(DeliveryStatus::Read)
    );
}

// ===== Receipts =====

#[test]
fn test_mark_read_sends_once() {
    let mut fx = fixture();
    let sender = PeerId::Short([1; 8]);
    fx.mesh.set_reachable(&sender);

    fx.node.mark_read(&sender, "mid-2", "me").unwrap();
    fx.node.mark_read(&sender, "mid-2", "me").unwrap();

    assert_eq!(fx.mesh.receipts.lock().unwrap().len(), 1);
}

// ===== Verification =====

#[test]
fn test_verification_roundtrip_nonce_checked() {
    let mut fx = fixture();
    let peer = PeerId::Short([5; 8]);

    fx.node.verify_peer(&peer, [1; 32], [2; 32]).unwrap();

    // Extract the challenge we sent
    let sent = fx.mesh.packets.lock().unwrap().remove(0);
    assert_eq!(sent.0.kind, kind::VERIFY_CHALLENGE);
    let challenge = VerificationPayload::decode(&sent.0.payload).unwrap();

    // Peer responds with the right nonce
    let response = VerificationPayload::respond(&challenge, vec![0xaa; 64]);
    let packet = Packet::unicast(
        kind::VERIFY_RESPONSE,
        7,
        1_700_000_000_300,
        [5; 8],
        [0xee; 8],
        response.encode().unwrap(),
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));

    assert!(matches!(
        fx.app_rx.try_recv().unwrap(),
        AppEvent::VerificationResponse { .. }
    ));
}

#[test]
fn test_verification_response_with_wrong_nonce_dropped() {
    let mut fx = fixture();
    let peer = PeerId::Short([6; 8]);
    fx.node.verify_peer(&peer, [1; 32], [2; 32]).unwrap();
    fx.mesh.packets.lock().unwrap().clear();

    let forged = VerificationPayload::respond(
        &VerificationPayload::challenge([1; 32], [2; 32], [9; 32]),
        vec![0xaa; 64],
    );
    let packet = Packet::unicast(
        kind::VERIFY_RESPONSE,
        7,
        1_700_000_000_400,
        [6; 8],
        [0xee; 8],
        forged.encode().unwrap(),
    );
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));

    assert!(fx.app_rx.try_recv().is_err());
}

// ===== Peer lifecycle =====

#[tokio::test]
async fn test_peer_appeared_flushes_and_notifies() {
    let mut fx = fixture();
    let peer = PeerId::Short([7; 8]);

    // Park a message for the offline peer
    fx.node.send_private("queued", &peer, "nick", "mid-3").unwrap();
    assert_eq!(fx.node.router().outbox_for(&peer).len(), 1);

    fx.mesh.set_reachable(&peer);
    fx.node.handle_mesh_event(MeshEvent::PeerAppeared(peer.clone()));

    assert!(fx.node.router().outbox_for(&peer).is_empty());
    assert_eq!(fx.mesh.private_sends.lock().unwrap().len(), 1);
    assert!(matches!(
        fx.app_rx.try_recv().unwrap(),
        AppEvent::PeerAppeared { .. }
    ));
}

// ===== Overlay ingress =====

#[test]
fn test_overlay_wrap_delivered_and_deduped() {
    let mut fx = fixture();
    // Sender side: separate transport with an open gate, sealing to our
    // DM key
    let sender_proxy = Arc::new(ProxyManager::new(
        &OverlayConfig::default(),
        &PolicyConfig { fail_closed: false },
    ));
    let sender = OverlayTransport::new(
        sender_proxy,
        Arc::new(NullSink) as Arc<dyn RelaySink>,
        RelayDirectory::embedded(),
        5,
        crate::config::PowConfig::default(),
        [44u8; 32],
    )
    .unwrap();

    let wrap = sender
        .send_private_dm("wrapped hi", &fx.node.overlay().dm_pubkey_hex(), "mid-w")
        .unwrap();

    fx.node.handle_overlay_event(wrap.clone());
    match fx.app_rx.try_recv().unwrap() {
        AppEvent::PrivateMessage {
            from,
            content,
            message_id,
            ..
        } => {
            assert_eq!(content, "wrapped hi");
            assert_eq!(message_id, "mid-w");
            assert!(matches!(from, PeerId::Overlay(_)));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    // An overlapping subscription delivers the same event again
    fx.node.handle_overlay_event(wrap);
    assert!(fx.app_rx.try_recv().is_err());
    assert_eq!(fx.node.stats().dropped_duplicate, 1);
}

#[test]
fn test_overlay_ack_folds_into_status_ledger() {
    let mut fx = fixture();
    let identity = crate::identity::OverlayIdentity::from_secret_bytes(&[55u8; 32]).unwrap();
    let ack = OverlayEvent::build(
        &identity,
        1_700_000_000,
        crate::overlay::event::kind::DELIVERY_ACK,
        vec![],
        "mid-a".to_string(),
    );

    fx.node.handle_overlay_event(ack);
    assert_eq!(
        fx.node.router().delivery_status("mid-a"),
        Some(DeliveryStatus::Delivered)
    );
}

// ===== Bookmarks =====

#[test]
fn test_bookmark_surface() {
    let fx = fixture();
    assert!(fx.node.bookmark_channel("EZS42"));
    assert!(!fx.node.bookmark_channel("ezs42"));
    assert_eq!(fx.node.bookmarked_channels(), vec!["ezs42"]);
    assert!(fx.node.unbookmark_channel("ezs42"));
}

// ===== Panic wipe =====

#[test]
fn test_panic_wipe_resets_everything() {
    let mut fx = fixture();
    let peer = PeerId::Short([8; 8]);
    let packet = broadcast_message(1, 0, "before wipe");

    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet.clone()));
    fx.node.send_private("queued", &peer, "nick", "mid-4").unwrap();
    fx.node.favorites().set(PeerId::Full([9; 32]), true, None);

    fx.node.panic_wipe();

    assert_eq!(fx.node.router().outbox_len(), 0);
    assert!(fx.node.favorites().is_empty());
    // The wiped seen-set treats the old packet as new again
    let _ = fx.app_rx.try_recv();
    fx.node.handle_mesh_event(MeshEvent::PacketDecoded(packet));
    assert!(matches!(
        fx.app_rx.try_recv().unwrap(),
        AppEvent::PublicMessage { .. }
    ));
}
