//! Node Orchestration
//!
//! Top-level container wiring the router, gossip manager, overlay
//! transport, proxy, and ledgers together, and running the single-context
//! event loop. All shared-map mutation (outbox, gossip storage, statuses,
//! pending verifications) happens here, on the loop's context; background
//! work (bootstrap polling, gossip timers, peer-sync delays) runs as
//! named tasks that only send events back in.
//!
//! ## Ingress pipeline
//!
//! radio bytes -> driver decode -> rate limit -> seen-set dedup ->
//! kind dispatch -> app event. Malformed input, duplicates, and
//! rate-limited packets are counted, logged at debug, and dropped; they
//! never propagate above this layer.
//!
//! ## Driver payload contract
//!
//! Private `MESSAGE` packets carry a JSON body (content, nickname,
//! message id) produced by the driver after decryption. Broadcast
//! `MESSAGE` payloads are raw UTF-8 content.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::Error;
use crate::favorites::{FavoriteStatusChanged, Favorites};
use crate::gossip::{GossipSyncManager, NEW_PEER_SYNC_DELAY_SECS, SYNC_TIMER_LEEWAY_SECS};
use crate::identity::PeerId;
use crate::ledger::{BookmarkStore, ReceiptLedger};
use crate::mesh::{MeshEvent, MeshEventReceiver, MeshTransport};
use crate::overlay::{OverlayEvent, OverlayTransport};
use crate::proxy::ProxyManager;
use crate::rate_limit::IngressLimiter;
use crate::router::{DeliveryStatus, MessageRouter};
use crate::tasks::TaskSet;
use crate::wire::file::FilePacket;
use crate::wire::sync::SyncRequest;
use crate::wire::verify::VerificationPayload;
use crate::wire::{kind, Packet, WireError};

/// Events delivered up to the host application.
#[derive(Clone, Debug)]
pub enum AppEvent {
    /// A public broadcast message arrived on the mesh.
    PublicMessage {
        from: PeerId,
        content: String,
        timestamp_ms: u64,
    },
    /// A private message addressed to this device arrived.
    PrivateMessage {
        from: PeerId,
        content: String,
        nickname: String,
        message_id: String,
    },
    /// A file transfer arrived.
    FileReceived { from: PeerId, file: FilePacket },
    /// A peer announced itself.
    Announce { peer: PeerId, payload: Vec<u8> },
    /// A tracked message changed delivery status.
    DeliveryStatusChanged {
        message_id: String,
        status: DeliveryStatus,
    },
    /// A peer entered the flood horizon.
    PeerAppeared { peer: PeerId },
    /// A peer left the flood horizon.
    PeerDisappeared { peer: PeerId },
    /// A peer favorited or unfavorited us.
    FavoriteNotified { peer: PeerId, is_favorite: bool },
    /// A verification challenge arrived; the identity collaborator signs.
    VerificationChallenge {
        from: PeerId,
        payload: VerificationPayload,
    },
    /// A verification response arrived with a matching nonce; the
    /// identity collaborator checks the signature.
    VerificationResponse {
        from: PeerId,
        payload: VerificationPayload,
    },
    /// A verified overlay event passed dedup (geohash note or wrap).
    OverlayEventReceived { event: OverlayEvent },
}

/// Driver JSON body for private messages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PrivateMessageBody {
    /// Message content.
    pub content: String,
    /// Sender nickname at send time.
    pub nickname: String,
    /// Message id for acks and receipts.
    pub message_id: String,
}

/// Internal events from background tasks into the loop.
enum InternalEvent {
    GossipTick,
    PeerSync([u8; 8]),
}

/// Ingress counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct NodeStats {
    /// Packets handed in by the driver.
    pub received: u64,
    /// Packets dropped by the rate limiter.
    pub dropped_rate_limited: u64,
    /// Packets dropped as duplicates.
    pub dropped_duplicate: u64,
    /// Packets dropped as malformed.
    pub dropped_malformed: u64,
    /// Sync requests served.
    pub sync_served: u64,
}

/// A running messaging core.
pub struct Node {
    config: Config,
    mesh: Arc<dyn MeshTransport>,
    overlay: Arc<OverlayTransport>,
    proxy: Arc<ProxyManager>,
    favorites: Arc<Favorites>,
    router: MessageRouter,
    gossip: GossipSyncManager,
    limiter: IngressLimiter,
    receipts: ReceiptLedger,
    bookmarks: BookmarkStore,
    stats: NodeStats,
    tasks: TaskSet,
    app_tx: mpsc::UnboundedSender<AppEvent>,
    internal_tx: mpsc::UnboundedSender<InternalEvent>,
    /// Taken by `run`; present until the loop starts.
    internal_rx: Option<mpsc::UnboundedReceiver<InternalEvent>>,
    /// Outstanding challenge nonces by peer short hex.
    pending_verifications: HashMap<String, [u8; 32]>,
}

impl Node {
    /// Wire up a node. Returns the node and the app event stream.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        mesh: Arc<dyn MeshTransport>,
        overlay: Arc<OverlayTransport>,
        proxy: Arc<ProxyManager>,
        favorites: Arc<Favorites>,
        receipts: ReceiptLedger,
        bookmarks: BookmarkStore,
    ) -> (Self, mpsc::UnboundedReceiver<AppEvent>) {
        let (app_tx, app_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let seen = Arc::new(crate::bloom::SeenFilter::with_params(
            config.bloom.max_bytes(),
            config.bloom.target_fpr(),
        ));
        let gossip = GossipSyncManager::new(seen);
        let limiter = IngressLimiter::new(
            config.ingress.sender_burst(),
            config.ingress.sender_refill_rate(),
            config.ingress.content_burst(),
            config.ingress.content_refill_rate(),
        );
        let router = MessageRouter::new(
            mesh.clone(),
            overlay.clone(),
            favorites.clone(),
            config.outbox.cap_per_peer(),
            config.mesh.ttl_default(),
        );

        let node = Self {
            config,
            mesh,
            overlay,
            proxy,
            favorites,
            router,
            gossip,
            limiter,
            receipts,
            bookmarks,
            stats: NodeStats::default(),
            tasks: TaskSet::new(),
            app_tx,
            internal_tx,
            internal_rx: Some(internal_rx),
            pending_verifications: HashMap::new(),
        };
        (node, app_rx)
    }

    /// Spawn the named background tasks: the bootstrap poller and the
    /// periodic gossip timer.
    pub fn start_background_tasks(&mut self) {
        let proxy = self.proxy.clone();
        self.tasks.spawn("bootstrap-poller", async move {
            if let Err(error) = proxy.start_if_needed().await {
                warn!(%error, "Proxy bootstrap failed; overlay stays gated");
            }
        });

        let internal_tx = self.internal_tx.clone();
        let period = std::time::Duration::from_secs(self.config.gossip.period_seconds());
        let leeway = std::time::Duration::from_secs(SYNC_TIMER_LEEWAY_SECS);
        self.tasks.spawn("gossip-timer", async move {
            let start = tokio::time::Instant::now() + period + leeway;
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if internal_tx.send(InternalEvent::GossipTick).is_err() {
                    return;
                }
            }
        });
    }

    /// Run the main event loop until every input channel closes.
    pub async fn run(&mut self, mut mesh_rx: MeshEventReceiver) {
        let mut favorite_rx = self.favorites.subscribe();
        let Some(mut internal_rx) = self.internal_rx.take() else {
            warn!("Node::run called twice; ignoring");
            return;
        };
        loop {
            tokio::select! {
                mesh_event = mesh_rx.recv() => {
                    match mesh_event {
                        Some(event) => self.handle_mesh_event(event),
                        None => break,
                    }
                }
                favorite_event = favorite_rx.recv() => {
                    match favorite_event {
                        Ok(change) => self.handle_favorite_changed(&change),
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Favorite events lagged; events dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                internal = internal_rx.recv() => {
                    match internal {
                        Some(event) => self.handle_internal(event),
                        None => break,
                    }
                }
            }
        }
        self.tasks.shutdown();
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    /// Process one driver event. Public so embedders without the loop
    /// can drive the node directly.
    pub fn handle_mesh_event(&mut self, event: MeshEvent) {
        match event {
            MeshEvent::PacketDecoded(packet) => self.handle_packet(packet),
            MeshEvent::PeerAppeared(peer) => {
                self.router.on_peer_reachable(&peer);
                self.schedule_peer_sync(&peer);
                self.emit(AppEvent::PeerAppeared { peer });
            }
            MeshEvent::PeerDisappeared(peer) => {
                self.emit(AppEvent::PeerDisappeared { peer });
            }
            MeshEvent::HandshakeCompleted(peer) => {
                self.router.on_peer_reachable(&peer);
            }
        }
    }

    /// Process a favorite status change (typed channel from the store).
    pub fn handle_favorite_changed(&mut self, change: &FavoriteStatusChanged) {
        self.router.on_favorite_changed(change);
    }

    fn handle_internal(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::GossipTick => self.broadcast_sync_request(None),
            InternalEvent::PeerSync(peer) => self.broadcast_sync_request(Some(peer)),
        }
        self.tasks.reap();
    }

    fn handle_packet(&mut self, packet: Packet) {
        self.stats.received += 1;

        if !self.limiter.admit(packet.sender_id, &packet.payload) {
            self.stats.dropped_rate_limited += 1;
            debug!(sender = %hex::encode(packet.sender_id), "Packet rate limited");
            return;
        }

        if !self.gossip.observe(&packet) {
            self.stats.dropped_duplicate += 1;
            return;
        }

        let from = PeerId::Short(packet.sender_id);
        match packet.kind {
            kind::MESSAGE => self.handle_message(from, packet),
            kind::ANNOUNCE => {
                self.emit(AppEvent::Announce {
                    peer: from,
                    payload: packet.payload,
                });
            }
            kind::REQUEST_SYNC => self.handle_sync_request(from, &packet),
            kind::DELIVERY_ACK => {
                let message_id = String::from_utf8_lossy(&packet.payload).into_owned();
                let status = self
                    .router
                    .update_delivery_status(&message_id, DeliveryStatus::Delivered);
                self.emit(AppEvent::DeliveryStatusChanged { message_id, status });
            }
            kind::READ_RECEIPT => {
                let message_id = String::from_utf8_lossy(&packet.payload).into_owned();
                let status = self
                    .router
                    .update_delivery_status(&message_id, DeliveryStatus::Read);
                self.emit(AppEvent::DeliveryStatusChanged { message_id, status });
            }
            kind::FILE_TRANSFER => match FilePacket::decode(&packet.payload) {
                Ok(file) => self.emit(AppEvent::FileReceived { from, file }),
                Err(error) => {
                    self.stats.dropped_malformed += 1;
                    debug!(%error, "Malformed file transfer dropped");
                }
            },
            kind::VERIFY_CHALLENGE => match VerificationPayload::decode(&packet.payload) {
                Ok(payload) => self.emit(AppEvent::VerificationChallenge { from, payload }),
                Err(error) => {
                    self.stats.dropped_malformed += 1;
                    debug!(%error, "Malformed verification challenge dropped");
                }
            },
            kind::VERIFY_RESPONSE => self.handle_verify_response(from, &packet),
            kind::FAVORITED => {
                let is_favorite = packet.payload.first().copied().unwrap_or(0) != 0;
                self.emit(AppEvent::FavoriteNotified {
                    peer: from,
                    is_favorite,
                });
            }
            other => {
                debug!(kind = other, "Ignoring unknown packet kind");
            }
        }
    }

    fn handle_message(&mut self, from: PeerId, packet: Packet) {
        if packet.is_broadcast() {
            self.emit(AppEvent::PublicMessage {
                from,
                content: String::from_utf8_lossy(&packet.payload).into_owned(),
                timestamp_ms: packet.timestamp_ms,
            });
            return;
        }

        // Unicast: only deliver what is addressed to us
        let ours = self.mesh.my_peer_id().short_id();
        if packet.recipient_id != ours {
            return;
        }

        let body: PrivateMessageBody = match serde_json::from_slice(&packet.payload) {
            Ok(body) => body,
            Err(error) => {
                self.stats.dropped_malformed += 1;
                debug!(%error, "Malformed private message body dropped");
                return;
            }
        };

        // Acknowledge delivery before handing upward; a failed ack is the
        // sender's retry problem, not a delivery blocker
        if let Err(error) = self.router.send_delivery_ack(&from, &body.message_id) {
            debug!(%error, "Could not send delivery ack");
        }

        self.emit(AppEvent::PrivateMessage {
            from,
            content: body.content,
            nickname: body.nickname,
            message_id: body.message_id,
        });
    }

    fn handle_sync_request(&mut self, from: PeerId, packet: &Packet) {
        let request = match SyncRequest::decode(&packet.payload) {
            Ok(request) => request,
            Err(error) => {
                self.stats.dropped_malformed += 1;
                debug!(%error, "Malformed sync request dropped");
                return;
            }
        };

        let replay = self.gossip.serve_sync_request(&request);
        self.stats.sync_served += 1;
        for missing in replay {
            if let Err(error) = self.mesh.send_packet(missing, Some(&from)) {
                debug!(%error, peer = %from, "Sync replay send failed");
                break;
            }
        }
    }

    /// Process an event the relay client delivered from a subscription.
    ///
    /// Verifies the signature, dedups by id across overlapping
    /// subscriptions, unseals wraps addressed to us, and folds ack kinds
    /// into the delivery-status ledger.
    pub fn handle_overlay_event(&mut self, incoming: crate::overlay::OverlayEvent) {
        use crate::overlay::event::kind as overlay_kind;

        if !self.overlay.admit_event(&incoming) {
            self.stats.dropped_duplicate += 1;
            return;
        }

        match incoming.kind {
            overlay_kind::GIFT_WRAP => match self.overlay.unseal_dm(&incoming) {
                Ok(payload) => {
                    self.emit(AppEvent::PrivateMessage {
                        from: PeerId::Overlay(payload.sender_pubkey),
                        content: payload.content,
                        nickname: String::new(),
                        message_id: payload.message_id,
                    });
                }
                Err(error) => {
                    // Not sealed to us, or garbage; relays fan wraps widely
                    self.stats.dropped_malformed += 1;
                    debug!(%error, id = %incoming.id, "Wrap not unsealable, dropped");
                }
            },
            overlay_kind::DELIVERY_ACK => {
                let message_id = incoming.content.clone();
                let status = self
                    .router
                    .update_delivery_status(&message_id, DeliveryStatus::Delivered);
                self.emit(AppEvent::DeliveryStatusChanged { message_id, status });
            }
            overlay_kind::READ_ACK => {
                let message_id = incoming.content.clone();
                let status = self
                    .router
                    .update_delivery_status(&message_id, DeliveryStatus::Read);
                self.emit(AppEvent::DeliveryStatusChanged { message_id, status });
            }
            _ => self.emit(AppEvent::OverlayEventReceived { event: incoming }),
        }
    }

    fn handle_verify_response(&mut self, from: PeerId, packet: &Packet) {
        let payload = match VerificationPayload::decode(&packet.payload) {
            Ok(payload) => payload,
            Err(error) => {
                self.stats.dropped_malformed += 1;
                debug!(%error, "Malformed verification response dropped");
                return;
            }
        };

        let Some(key) = from.short_hex() else { return };
        match self.pending_verifications.get(&key) {
            Some(nonce) if *nonce == payload.nonce => {
                self.pending_verifications.remove(&key);
                self.emit(AppEvent::VerificationResponse { from, payload });
            }
            _ => {
                debug!(peer = %from, "Verification response with unknown nonce dropped");
            }
        }
    }

    // ========================================================================
    // Sends
    // ========================================================================

    /// Send a private message (decision table + outbox).
    pub fn send_private(
        &mut self,
        content: &str,
        to: &PeerId,
        nickname: &str,
        message_id: &str,
    ) -> Result<(), Error> {
        self.router.send_private(content, to, nickname, message_id)
    }

    /// Broadcast a public message on the mesh and remember it for gossip
    /// replay.
    pub fn send_public(&mut self, content: &str) -> Result<(), Error> {
        let packet = self.router.send_public_mesh(content)?;
        self.gossip.record_own(&packet);
        Ok(())
    }

    /// Publish a public note in a geohash channel (PoW + overlay).
    pub async fn send_geohash_note(
        &self,
        geohash: &str,
        content: &str,
        nickname: Option<&str>,
    ) -> Result<OverlayEvent, Error> {
        self.overlay.send_geohash_note(geohash, content, nickname).await
    }

    /// Send a file over the mesh. `to == None` broadcasts.
    pub fn send_file(
        &self,
        file: &FilePacket,
        to: Option<&PeerId>,
        transfer_id: &str,
        message_id: &str,
    ) -> Result<(), Error> {
        let payload = file.encode().map_err(|error| match error {
            WireError::ContentOversize { limit } => Error::PayloadTooLarge {
                size: file.content.len(),
                limit,
            },
            other => Error::MalformedPacket(other),
        })?;
        self.mesh
            .send_file_transfer(&payload, to, transfer_id, message_id)?;
        Ok(())
    }

    /// Record a read and send the receipt, once per message id.
    pub fn mark_read(
        &mut self,
        from: &PeerId,
        message_id: &str,
        reader_nickname: &str,
    ) -> Result<(), Error> {
        if !self.receipts.mark_read(message_id) {
            return Ok(());
        }
        self.router.send_read_receipt(from, message_id, reader_nickname)
    }

    /// Begin a verification handshake with a peer.
    pub fn verify_peer(
        &mut self,
        to: &PeerId,
        noise_fingerprint: [u8; 32],
        signing_fingerprint: [u8; 32],
    ) -> Result<(), Error> {
        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let challenge =
            VerificationPayload::challenge(noise_fingerprint, signing_fingerprint, nonce);
        self.send_verification(to, kind::VERIFY_CHALLENGE, &challenge)?;

        if let Some(key) = to.short_hex() {
            self.pending_verifications.insert(key, nonce);
        }
        Ok(())
    }

    /// Answer a received challenge with the signature produced by the
    /// identity collaborator.
    pub fn respond_to_challenge(
        &mut self,
        to: &PeerId,
        challenge: &VerificationPayload,
        signature: Vec<u8>,
    ) -> Result<(), Error> {
        let response = VerificationPayload::respond(challenge, signature);
        self.send_verification(to, kind::VERIFY_RESPONSE, &response)
    }

    fn send_verification(
        &self,
        to: &PeerId,
        packet_kind: u8,
        payload: &VerificationPayload,
    ) -> Result<(), Error> {
        let sender = self
            .mesh
            .my_peer_id()
            .short_id()
            .ok_or_else(|| Error::TransportUnavailable {
                peer: to.to_string(),
            })?;
        let recipient = to.short_id().ok_or_else(|| Error::TransportUnavailable {
            peer: to.to_string(),
        })?;

        let packet = Packet::unicast(
            packet_kind,
            self.config.mesh.ttl_default(),
            unix_now_ms(),
            sender,
            recipient,
            payload.encode()?,
        );
        self.mesh.send_packet(packet, Some(to))?;
        Ok(())
    }

    // ========================================================================
    // Gossip timers
    // ========================================================================

    fn schedule_peer_sync(&mut self, peer: &PeerId) {
        let Some(short) = peer.short_id() else { return };
        let internal_tx = self.internal_tx.clone();
        self.tasks.spawn("peer-sync", async move {
            tokio::time::sleep(std::time::Duration::from_secs(NEW_PEER_SYNC_DELAY_SECS)).await;
            let _ = internal_tx.send(InternalEvent::PeerSync(short));
        });
    }

    fn broadcast_sync_request(&mut self, recipient: Option<[u8; 8]>) {
        let Some(sender) = self.mesh.my_peer_id().short_id() else {
            return;
        };
        let request = self
            .gossip
            .build_sync_request(sender, recipient, unix_now_ms());
        let signed = self.mesh.sign_packet_for_broadcast(request);
        let to = recipient.map(PeerId::Short);
        if let Err(error) = self.mesh.send_packet(signed, to.as_ref()) {
            debug!(%error, "Sync request send failed");
        }
    }

    // ========================================================================
    // Surfaces
    // ========================================================================

    /// Bookmark a geohash channel.
    pub fn bookmark_channel(&self, geohash: &str) -> bool {
        self.bookmarks.add(geohash)
    }

    /// Remove a channel bookmark.
    pub fn unbookmark_channel(&self, geohash: &str) -> bool {
        self.bookmarks.remove(geohash)
    }

    /// All bookmarked channels.
    pub fn bookmarked_channels(&self) -> Vec<String> {
        self.bookmarks.list()
    }

    /// Ingress counters.
    pub fn stats(&self) -> NodeStats {
        self.stats
    }

    /// The favorites store handle.
    pub fn favorites(&self) -> &Arc<Favorites> {
        &self.favorites
    }

    /// The overlay transport handle.
    pub fn overlay(&self) -> &Arc<OverlayTransport> {
        &self.overlay
    }

    /// The proxy manager handle.
    pub fn proxy(&self) -> &Arc<ProxyManager> {
        &self.proxy
    }

    /// The router (outbox inspection, status queries).
    pub fn router(&self) -> &MessageRouter {
        &self.router
    }

    /// Synchronously reset all in-memory state: outbox, delivery
    /// statuses, gossip storage, seen filter, favorites, overlay dedup,
    /// rate-limit buckets, pending verifications. Not an error path; an
    /// explicit external operation.
    pub fn panic_wipe(&mut self) {
        self.router.wipe();
        self.gossip.wipe();
        self.favorites.wipe();
        self.overlay.wipe();
        self.limiter.clear();
        self.pending_verifications.clear();
        info!("Panic wipe complete");
    }

    fn emit(&self, event: AppEvent) {
        if self.app_tx.send(event).is_err() {
            debug!("App event receiver dropped");
        }
    }
}

/// Current Unix time in milliseconds.
fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests;
