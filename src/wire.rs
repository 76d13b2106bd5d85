//! Wire Format Parsing and Serialization
//!
//! Defines the mesh packet wire format and the 16-byte packet fingerprint
//! used for deduplication and anti-entropy sketches. All multi-byte
//! integers are big-endian.
//!
//! ## Packet Layout
//!
//! ```text
//! [kind:1][flags:1][ttl:1][timestamp_ms:8 BE][sender_id:8]
//!     [recipient_id:8 if FLAG_HAS_RECIPIENT]
//!     [payload_len:2 BE][payload]
//!     [sig_len:1][sig if FLAG_HAS_SIGNATURE]
//! ```
//!
//! Truncation or an out-of-range length fails decode; the ingress path
//! drops the packet and continues.

pub mod file;
pub mod sync;
pub mod verify;

use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

// ============================================================================
// Kind Registry
// ============================================================================

/// Packet kind registry. Kinds are a closed set per protocol generation;
/// unknown kinds decode successfully and are ignored above ingress.
pub mod kind {
    /// Presence + identity material announcement (broadcast).
    pub const ANNOUNCE: u8 = 0x01;
    /// Chat message (broadcast when no recipient, private otherwise).
    pub const MESSAGE: u8 = 0x04;
    /// Delivery acknowledgement for a private message.
    pub const DELIVERY_ACK: u8 = 0x0a;
    /// Read receipt for a private message.
    pub const READ_RECEIPT: u8 = 0x0c;
    /// Verification challenge (mutual identity proof).
    pub const VERIFY_CHALLENGE: u8 = 0x10;
    /// Verification response.
    pub const VERIFY_RESPONSE: u8 = 0x11;
    /// Favorite / unfavorite notification.
    pub const FAVORITED: u8 = 0x12;
    /// Anti-entropy sync solicitation carrying a Bloom sketch.
    pub const REQUEST_SYNC: u8 = 0x21;
    /// File transfer payload (TLV-framed).
    pub const FILE_TRANSFER: u8 = 0x22;
}

// ============================================================================
// Constants
// ============================================================================

/// Flag bit: an 8-byte recipient id follows the sender id.
pub const FLAG_HAS_RECIPIENT: u8 = 0x01;

/// Flag bit: a signature trailer follows the payload.
pub const FLAG_HAS_SIGNATURE: u8 = 0x02;

/// Fixed header size before the optional recipient id.
pub const HEADER_SIZE: usize = 1 + 1 + 1 + 8 + 8;

/// Size of the packet fingerprint in bytes.
pub const FINGERPRINT_SIZE: usize = 16;

/// Absolute payload ceiling shared by file transfers and voice notes.
pub const MAX_FILE_PAYLOAD: usize = 1024 * 1024;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced by the wire codecs.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("truncated at {context}: need {need} bytes, have {have}")]
    Truncated {
        context: &'static str,
        need: usize,
        have: usize,
    },

    #[error("length field out of range at {context}")]
    LengthOutOfRange { context: &'static str },

    #[error("{0} trailing bytes after packet end")]
    TrailingBytes(usize),

    #[error("unknown TLV type 0x{0:02x}")]
    UnknownTlvType(u8),

    #[error("file content is empty")]
    EmptyContent,

    #[error("file content exceeds {limit} bytes")]
    ContentOversize { limit: usize },

    #[error("FILE_SIZE value must be exactly 4 bytes, got {0}")]
    BadFileSizeValue(usize),

    #[error("bloom bits length {got} does not match m_bytes {expected}")]
    BitsLengthMismatch { expected: usize, got: usize },

    #[error("missing required TLV 0x{0:02x}")]
    MissingTlv(u8),

    #[error("TLV value has wrong size at type 0x{tlv:02x}: expected {expected}, got {got}")]
    BadTlvValueSize {
        tlv: u8,
        expected: usize,
        got: usize,
    },
}

// ============================================================================
// Fingerprint
// ============================================================================

/// 16-byte deterministic packet digest.
///
/// Derived from (sender, kind, timestamp, payload) only: ttl mutates in
/// flight and signatures may be attached after construction, so neither
/// participates. Peers must agree on this derivation byte-for-byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes.
    pub fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }

    /// Lowercase hex form, used as a map key.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short prefix only; full hex is noisy in logs
        write!(f, "Fingerprint({}..)", &self.to_hex()[..8])
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A mesh packet.
///
/// `recipient_id == None` means broadcast. The signature covers
/// driver-defined bytes and is attached by `sign_packet_for_broadcast`;
/// this codec only frames it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    /// Kind byte from the registry.
    pub kind: u8,
    /// Remaining flood hops. 0 means local-only: neighbors must not forward.
    pub ttl: u8,
    /// Sender clock at construction, Unix milliseconds.
    pub timestamp_ms: u64,
    /// 8-byte short routing id of the sender.
    pub sender_id: [u8; 8],
    /// 8-byte short routing id of the recipient, absent for broadcast.
    pub recipient_id: Option<[u8; 8]>,
    /// Kind-specific payload.
    pub payload: Vec<u8>,
    /// Optional signature trailer (at most 255 bytes on the wire).
    pub signature: Option<Vec<u8>>,
}

impl Packet {
    /// Construct a broadcast packet.
    pub fn broadcast(
        kind: u8,
        ttl: u8,
        timestamp_ms: u64,
        sender_id: [u8; 8],
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id: None,
            payload,
            signature: None,
        }
    }

    /// Construct a unicast packet.
    pub fn unicast(
        kind: u8,
        ttl: u8,
        timestamp_ms: u64,
        sender_id: [u8; 8],
        recipient_id: [u8; 8],
        payload: Vec<u8>,
    ) -> Self {
        Self {
            kind,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id: Some(recipient_id),
            payload,
            signature: None,
        }
    }

    /// Whether this packet floods to all neighbors.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id.is_none()
    }

    /// Clone this packet with `ttl` forced to 0 (local-only delivery).
    ///
    /// Used by gossip replay so a neighbor filling a gap on behalf of a
    /// requester does not re-flood the mesh.
    pub fn clone_local(&self) -> Self {
        let mut clone = self.clone();
        clone.ttl = 0;
        clone
    }

    /// Decrement ttl in place; returns false if it was already exhausted.
    pub fn decrement_ttl(&mut self) -> bool {
        if self.ttl == 0 {
            return false;
        }
        self.ttl -= 1;
        true
    }

    /// Compute the deduplication fingerprint.
    ///
    /// SHA-256 over `sender_id || kind || timestamp_ms BE || payload`,
    /// truncated to 16 bytes. Excludes ttl, recipient, and signature so a
    /// relayed or re-signed copy fingerprints identically.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        hasher.update(self.sender_id);
        hasher.update([self.kind]);
        hasher.update(self.timestamp_ms.to_be_bytes());
        hasher.update(&self.payload);
        let digest = hasher.finalize();

        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&digest[..FINGERPRINT_SIZE]);
        Fingerprint(bytes)
    }

    /// Serialize to wire bytes.
    ///
    /// Payloads above the u16 length ceiling are a driver fragmentation
    /// bug, not a runtime condition.
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.payload.len() <= u16::MAX as usize);
        let mut flags = 0u8;
        if self.recipient_id.is_some() {
            flags |= FLAG_HAS_RECIPIENT;
        }
        if self.signature.is_some() {
            flags |= FLAG_HAS_SIGNATURE;
        }

        let sig_len = self.signature.as_ref().map_or(0, |s| 1 + s.len());
        let mut out = Vec::with_capacity(HEADER_SIZE + 8 + 2 + self.payload.len() + sig_len);
        out.push(self.kind);
        out.push(flags);
        out.push(self.ttl);
        out.extend_from_slice(&self.timestamp_ms.to_be_bytes());
        out.extend_from_slice(&self.sender_id);
        if let Some(recipient) = &self.recipient_id {
            out.extend_from_slice(recipient);
        }
        out.extend_from_slice(&(self.payload.len() as u16).to_be_bytes());
        out.extend_from_slice(&self.payload);
        if let Some(sig) = &self.signature {
            out.push(sig.len() as u8);
            out.extend_from_slice(sig);
        }
        out
    }

    /// Parse a packet from wire bytes.
    ///
    /// The buffer must contain exactly one packet; trailing bytes fail
    /// decode (radio framing delivers whole packets).
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut cursor = Cursor::new(data);

        let kind = cursor.take_u8("kind")?;
        let flags = cursor.take_u8("flags")?;
        let ttl = cursor.take_u8("ttl")?;
        let timestamp_ms = cursor.take_u64("timestamp")?;
        let sender_id: [u8; 8] = cursor.take_array("sender_id")?;

        let recipient_id = if flags & FLAG_HAS_RECIPIENT != 0 {
            Some(cursor.take_array("recipient_id")?)
        } else {
            None
        };

        let payload_len = cursor.take_u16("payload_len")? as usize;
        let payload = cursor.take_slice("payload", payload_len)?.to_vec();

        let signature = if flags & FLAG_HAS_SIGNATURE != 0 {
            let sig_len = cursor.take_u8("sig_len")? as usize;
            Some(cursor.take_slice("signature", sig_len)?.to_vec())
        } else {
            None
        };

        if cursor.remaining() > 0 {
            return Err(WireError::TrailingBytes(cursor.remaining()));
        }

        Ok(Self {
            kind,
            ttl,
            timestamp_ms,
            sender_id,
            recipient_id,
            payload,
            signature,
        })
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Bounds-checked read cursor shared by the packet and TLV codecs.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn take_slice(
        &mut self,
        context: &'static str,
        len: usize,
    ) -> Result<&'a [u8], WireError> {
        if self.remaining() < len {
            return Err(WireError::Truncated {
                context,
                need: len,
                have: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub(crate) fn take_u8(&mut self, context: &'static str) -> Result<u8, WireError> {
        Ok(self.take_slice(context, 1)?[0])
    }

    pub(crate) fn take_u16(&mut self, context: &'static str) -> Result<u16, WireError> {
        let slice = self.take_slice(context, 2)?;
        Ok(u16::from_be_bytes([slice[0], slice[1]]))
    }

    pub(crate) fn take_u32(&mut self, context: &'static str) -> Result<u32, WireError> {
        let slice = self.take_slice(context, 4)?;
        Ok(u32::from_be_bytes([slice[0], slice[1], slice[2], slice[3]]))
    }

    pub(crate) fn take_u64(&mut self, context: &'static str) -> Result<u64, WireError> {
        let slice = self.take_slice(context, 8)?;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(slice);
        Ok(u64::from_be_bytes(bytes))
    }

    pub(crate) fn take_array<const N: usize>(
        &mut self,
        context: &'static str,
    ) -> Result<[u8; N], WireError> {
        let slice = self.take_slice(context, N)?;
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(slice);
        Ok(bytes)
    }
}

// ============================================================================
// Tests
// ============================================================================
