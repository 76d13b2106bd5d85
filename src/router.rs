//! Message Router + Outbox
//!
//! The decision core for outgoing traffic. For a private message the
//! transport choice is reachability-driven:
//!
//! | mesh-reachable | overlay mapping | action                      |
//! |----------------|-----------------|-----------------------------|
//! | yes            | any             | send over mesh              |
//! | no             | yes             | send over overlay (gated)   |
//! | no             | no              | park in the per-peer outbox |
//!
//! The outbox drains in FIFO order when a `FavoriteStatusChanged` event
//! produces a mapping or the peer becomes mesh-reachable. Receipts prefer
//! the mesh when reachable (cheaper, faster), falling back to the
//! overlay. Delivery status only moves forward along
//! `sending < sent < delivered < read`; late or reordered acks can never
//! downgrade a message.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};

use crate::error::Error;
use crate::favorites::{FavoriteStatusChanged, Favorites};
use crate::identity::PeerId;
use crate::mesh::{MeshTransport, ReadReceipt};
use crate::wire::{kind, Packet};

/// Delivery lifecycle of an outgoing message. Ordering is the transition
/// order; updates never move backward.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeliveryStatus {
    /// Accepted by the router, not yet handed to a transport.
    Sending,
    /// Handed to a transport.
    Sent,
    /// The recipient's device acknowledged delivery.
    Delivered,
    /// The recipient read the message.
    Read,
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeliveryStatus::Sending => "sending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        };
        write!(f, "{}", s)
    }
}

/// A send parked until a transport becomes available.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboxEntry {
    /// Message content.
    pub content: String,
    /// Recipient nickname at enqueue time.
    pub nickname: String,
    /// Message id, preserved across the deferred delivery.
    pub message_id: String,
}

/// Overlay operations the router needs; implemented by the overlay
/// transport, mocked in tests.
pub trait OverlaySender: Send + Sync {
    /// Send a gift-wrapped direct message.
    fn send_private_message(
        &self,
        content: &str,
        recipient_pubkey: &str,
        message_id: &str,
    ) -> Result<(), Error>;

    /// Send a delivery acknowledgement.
    fn send_delivery_ack(&self, recipient_pubkey: &str, message_id: &str) -> Result<(), Error>;

    /// Send a read receipt.
    fn send_read_receipt(&self, recipient_pubkey: &str, message_id: &str) -> Result<(), Error>;
}

/// The message router.
///
/// Exclusively owns the outbox and the delivery-status ledger; all
/// mutation happens on the node's main context.
pub struct MessageRouter {
    mesh: Arc<dyn MeshTransport>,
    overlay: Arc<dyn OverlaySender>,
    favorites: Arc<Favorites>,
    /// Per-peer FIFO of deferred sends, keyed by outbox key.
    outbox: HashMap<String, VecDeque<OutboxEntry>>,
    /// message id -> latest status.
    statuses: HashMap<String, DeliveryStatus>,
    /// Cap per peer queue.
    outbox_cap: usize,
    /// Initial flood TTL for public packets.
    default_ttl: u8,
}

impl MessageRouter {
    /// Create a router.
    pub fn new(
        mesh: Arc<dyn MeshTransport>,
        overlay: Arc<dyn OverlaySender>,
        favorites: Arc<Favorites>,
        outbox_cap: usize,
        default_ttl: u8,
    ) -> Self {
        Self {
            mesh,
            overlay,
            favorites,
            outbox: HashMap::new(),
            statuses: HashMap::new(),
            outbox_cap,
            default_ttl,
        }
    }

    // ========================================================================
    // Private sends
    // ========================================================================

    /// Route a private message per the decision table.
    ///
    /// Unroutable messages are parked in the outbox and the call
    /// succeeds; the entry flushes on the next favorite or reachability
    /// event. An overlay attempt denied by the fail-closed gate parks the
    /// entry too, but propagates `ProxyNotReady` so a UI can surface it.
    pub fn send_private(
        &mut self,
        content: &str,
        to: &PeerId,
        nickname: &str,
        message_id: &str,
    ) -> Result<(), Error> {
        self.update_delivery_status(message_id, DeliveryStatus::Sending);

        if self.mesh.is_peer_reachable(to) {
            self.mesh
                .send_private_message(content, to, nickname, message_id)?;
            self.update_delivery_status(message_id, DeliveryStatus::Sent);
            return Ok(());
        }

        if let Some(pubkey) = self.favorites.overlay_mapping(to) {
            match self
                .overlay
                .send_private_message(content, &pubkey, message_id)
            {
                Ok(()) => {
                    self.update_delivery_status(message_id, DeliveryStatus::Sent);
                    return Ok(());
                }
                Err(Error::ProxyNotReady) => {
                    debug!(peer = %to, message_id, "Overlay gated, parking in outbox");
                    self.enqueue(to, content, nickname, message_id)?;
                    return Err(Error::ProxyNotReady);
                }
                Err(error) => return Err(error),
            }
        }

        debug!(peer = %to, message_id, "No transport for peer, parking in outbox");
        self.enqueue(to, content, nickname, message_id)
    }

    fn enqueue(
        &mut self,
        to: &PeerId,
        content: &str,
        nickname: &str,
        message_id: &str,
    ) -> Result<(), Error> {
        let key = outbox_key(to);
        let queue = self.outbox.entry(key).or_default();
        if queue.len() >= self.outbox_cap {
            warn!(peer = %to, "Outbox full, rejecting send");
            return Err(Error::TransportUnavailable {
                peer: to.to_string(),
            });
        }
        queue.push_back(OutboxEntry {
            content: content.to_string(),
            nickname: nickname.to_string(),
            message_id: message_id.to_string(),
        });
        Ok(())
    }

    // ========================================================================
    // Outbox flushing
    // ========================================================================

    /// Drain the outbox for one peer using the decision table. Entries
    /// that still cannot be sent stay queued, in order.
    pub fn flush_peer(&mut self, peer: &PeerId) {
        let key = outbox_key(peer);
        let Some(mut queue) = self.outbox.remove(&key) else {
            return;
        };
        let mut flushed = 0usize;

        while let Some(entry) = queue.pop_front() {
            let sent = if self.mesh.is_peer_reachable(peer) {
                self.mesh
                    .send_private_message(&entry.content, peer, &entry.nickname, &entry.message_id)
                    .is_ok()
            } else if let Some(pubkey) = self.favorites.overlay_mapping(peer) {
                self.overlay
                    .send_private_message(&entry.content, &pubkey, &entry.message_id)
                    .is_ok()
            } else {
                false
            };

            if sent {
                self.update_delivery_status(&entry.message_id, DeliveryStatus::Sent);
                flushed += 1;
            } else {
                // Put it back at the head; later entries stay behind it
                queue.push_front(entry);
                break;
            }
        }

        if !queue.is_empty() {
            self.outbox.insert(key, queue);
        }
        if flushed > 0 {
            info!(peer = %peer, flushed, "Flushed outbox entries");
        }
    }

    /// Favorite status changed (including key updates): re-evaluate the
    /// affected peer's outbox.
    pub fn on_favorite_changed(&mut self, change: &FavoriteStatusChanged) {
        self.flush_peer(&change.peer);
    }

    /// A peer became mesh-reachable: flush its outbox slice.
    pub fn on_peer_reachable(&mut self, peer: &PeerId) {
        self.flush_peer(peer);
    }

    /// Entries currently parked for a peer.
    pub fn outbox_for(&self, peer: &PeerId) -> Vec<OutboxEntry> {
        self.outbox
            .get(&outbox_key(peer))
            .map(|queue| queue.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Total parked entries across all peers.
    pub fn outbox_len(&self) -> usize {
        self.outbox.values().map(VecDeque::len).sum()
    }

    // ========================================================================
    // Receipts
    // ========================================================================

    /// Send a read receipt, preferring the mesh.
    pub fn send_read_receipt(
        &mut self,
        to: &PeerId,
        message_id: &str,
        reader_nickname: &str,
    ) -> Result<(), Error> {
        if self.mesh.is_peer_reachable(to) {
            let receipt = ReadReceipt {
                message_id: message_id.to_string(),
                reader_nickname: reader_nickname.to_string(),
            };
            self.mesh.send_read_receipt(&receipt, to)?;
            return Ok(());
        }
        if let Some(pubkey) = self.favorites.overlay_mapping(to) {
            return self.overlay.send_read_receipt(&pubkey, message_id);
        }
        Err(Error::TransportUnavailable {
            peer: to.to_string(),
        })
    }

    /// Send a delivery acknowledgement, preferring the mesh.
    pub fn send_delivery_ack(&mut self, to: &PeerId, message_id: &str) -> Result<(), Error> {
        if self.mesh.is_peer_reachable(to) {
            self.mesh.send_delivery_ack(message_id, to)?;
            return Ok(());
        }
        if let Some(pubkey) = self.favorites.overlay_mapping(to) {
            return self.overlay.send_delivery_ack(&pubkey, message_id);
        }
        Err(Error::TransportUnavailable {
            peer: to.to_string(),
        })
    }

    // ========================================================================
    // Public sends
    // ========================================================================

    /// Broadcast a public chat message on the mesh channel.
    ///
    /// Public mesh sends are unconditional: the flood itself is the
    /// delivery mechanism and gossip repairs any gaps.
    pub fn send_public_mesh(&mut self, content: &str) -> Result<Packet, Error> {
        let sender_id = self
            .mesh
            .my_peer_id()
            .short_id()
            .ok_or_else(|| Error::TransportUnavailable {
                peer: self.mesh.my_peer_id().to_string(),
            })?;
        let packet = Packet::broadcast(
            kind::MESSAGE,
            self.default_ttl,
            unix_now_ms(),
            sender_id,
            content.as_bytes().to_vec(),
        );
        let signed = self.mesh.sign_packet_for_broadcast(packet);
        self.mesh.send_packet(signed.clone(), None)?;
        Ok(signed)
    }

    // ========================================================================
    // Delivery status
    // ========================================================================

    /// Record a status for a message, ignoring backward transitions.
    /// Returns the effective status after the update.
    pub fn update_delivery_status(
        &mut self,
        message_id: &str,
        status: DeliveryStatus,
    ) -> DeliveryStatus {
        match self.statuses.get(message_id) {
            Some(&current) if current >= status => {
                debug!(message_id, %current, attempted = %status, "Ignoring status downgrade");
                current
            }
            _ => {
                self.statuses.insert(message_id.to_string(), status);
                status
            }
        }
    }

    /// Current status of a message, if tracked.
    pub fn delivery_status(&self, message_id: &str) -> Option<DeliveryStatus> {
        self.statuses.get(message_id).copied()
    }

    /// Reset outbox and status ledger (panic wipe).
    pub fn wipe(&mut self) {
        self.outbox.clear();
        self.statuses.clear();
    }
}

/// Outbox key for a peer: the short routing hex where derivable, the
/// display form otherwise (overlay-only ids).
fn outbox_key(peer: &PeerId) -> String {
    peer.short_hex().unwrap_or_else(|| peer.to_string())
}

/// Current Unix time in milliseconds.
fn unix_now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
