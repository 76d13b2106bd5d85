//! Mesh Transport Interface
//!
//! The contract between the core and the radio driver. The driver owns
//! the physical layer: fragmentation/reassembly, per-link handshakes, and
//! the outbound write buffer. The core owns everything above the packet:
//! dedup, gossip, routing, outbox.
//!
//! ## Backpressure contract
//!
//! The driver buffers outbound writes. When the pending buffer exceeds
//! roughly 1 MB it drops lowest-priority writes first: announce, then
//! broadcast, then private (`SendPriority` ordering). Send methods never
//! block the caller; they enqueue into the driver.

use std::fmt;

use thiserror::Error;
use tokio::sync::mpsc;

use crate::identity::PeerId;
use crate::wire::Packet;

/// Driver outbound buffer ceiling (bytes). Advisory for driver authors;
/// the core never buffers at this layer.
pub const OUTBOUND_BUFFER_LIMIT: usize = 1024 * 1024;

/// Errors surfaced by the radio driver.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("peer not connected: {0}")]
    NotConnected(String),

    #[error("driver outbound buffer full")]
    BufferFull,

    #[error("payload exceeds fragment budget: {size} bytes")]
    PayloadTooLarge { size: usize },

    #[error("driver send failed: {0}")]
    SendFailed(String),
}

/// Outbound write priority, lowest dropped first under backpressure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SendPriority {
    /// Presence announcements; regenerated every round, cheapest to lose.
    Announce,
    /// Broadcast chat; recoverable via gossip sync.
    Broadcast,
    /// Private traffic; never dropped while the buffer holds.
    Private,
}

/// A read receipt as handed to the driver.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReadReceipt {
    /// Id of the message that was read.
    pub message_id: String,
    /// Reader's display name at receipt time.
    pub reader_nickname: String,
}

/// Capability set the radio driver satisfies.
///
/// Send methods queue internally and return once the driver accepted the
/// write; the router never blocks on radio I/O.
pub trait MeshTransport: Send + Sync {
    /// This device's peer id, stable for the process lifetime.
    fn my_peer_id(&self) -> PeerId;

    /// Whether the peer is mesh-connected or multi-hop reachable within
    /// the current flood horizon.
    fn is_peer_reachable(&self, peer: &PeerId) -> bool;

    /// Whether a direct link to the peer exists.
    fn is_peer_connected(&self, peer: &PeerId) -> bool;

    /// Send a private chat message, initiating a handshake if needed.
    fn send_private_message(
        &self,
        content: &str,
        to: &PeerId,
        nickname: &str,
        message_id: &str,
    ) -> Result<(), MeshError>;

    /// Send a read receipt.
    fn send_read_receipt(&self, receipt: &ReadReceipt, to: &PeerId) -> Result<(), MeshError>;

    /// Send a delivery acknowledgement.
    fn send_delivery_ack(&self, message_id: &str, to: &PeerId) -> Result<(), MeshError>;

    /// Notify a peer it was favorited or unfavorited.
    fn send_favorite_notification(&self, to: &PeerId, is_favorite: bool) -> Result<(), MeshError>;

    /// Send a file transfer TLV payload. `recipient == None` broadcasts.
    fn send_file_transfer(
        &self,
        payload: &[u8],
        recipient: Option<&PeerId>,
        transfer_id: &str,
        message_id: &str,
    ) -> Result<(), MeshError>;

    /// Attach this device's signature to a broadcast packet.
    fn sign_packet_for_broadcast(&self, packet: Packet) -> Packet;

    /// Hand a fully framed packet to the driver. `to == None` broadcasts;
    /// gossip uses the unicast form for ttl=0 replay.
    fn send_packet(&self, packet: Packet, to: Option<&PeerId>) -> Result<(), MeshError>;
}

/// Events the driver emits up into the router.
#[derive(Clone, Debug)]
pub enum MeshEvent {
    /// A packet was received and decoded at the radio layer.
    PacketDecoded(Packet),
    /// A peer became reachable.
    PeerAppeared(PeerId),
    /// A peer left the flood horizon.
    PeerDisappeared(PeerId),
    /// A pairwise handshake completed; private sends may now flow.
    HandshakeCompleted(PeerId),
}

impl fmt::Display for MeshEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MeshEvent::PacketDecoded(packet) => write!(f, "packet(kind=0x{:02x})", packet.kind),
            MeshEvent::PeerAppeared(peer) => write!(f, "peer-appeared({})", peer),
            MeshEvent::PeerDisappeared(peer) => write!(f, "peer-disappeared({})", peer),
            MeshEvent::HandshakeCompleted(peer) => write!(f, "handshake({})", peer),
        }
    }
}

/// Sender half handed to the driver.
pub type MeshEventSender = mpsc::UnboundedSender<MeshEvent>;

/// Receiver half consumed by the node event loop.
pub type MeshEventReceiver = mpsc::UnboundedReceiver<MeshEvent>;

/// Create the driver-to-core event channel.
pub fn event_channel() -> (MeshEventSender, MeshEventReceiver) {
    mpsc::unbounded_channel()
}
