//! Crate-level error taxonomy.
//!
//! Each subsystem defines its own `thiserror` enum close to the code that
//! produces it; this module defines the taxonomy the rest of the crate (and
//! embedders) match on, with conversions from the module enums.
//!
//! Propagation policy:
//!
//! - Decode and signature failures never travel above packet ingress. They
//!   are counted and logged at debug level, then dropped.
//! - Send-path errors propagate to the caller so a UI can surface a
//!   `sending -> failed` transition.
//! - Proxy-readiness errors are never swallowed: a send attempted while the
//!   network gate is closed is denied and reported.

use thiserror::Error;

use crate::identity::IdentityError;
use crate::mesh::MeshError;
use crate::overlay::OverlayError;
use crate::proxy::ProxyError;
use crate::wire::WireError;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error taxonomy.
#[derive(Debug, Error)]
pub enum Error {
    /// A packet, TLV stream, or event failed structural validation.
    /// Recovered locally: the input is dropped and processing continues.
    #[error("malformed packet: {0}")]
    MalformedPacket(#[from] WireError),

    /// A packet signature did not verify against the claimed sender.
    #[error("invalid signature from {sender}")]
    SignatureInvalid {
        /// Hex short id of the claimed sender.
        sender: String,
    },

    /// A payload exceeded the transport ceiling. Rejected at ingress or
    /// at send time (the latter is user-visible).
    #[error("payload too large: {size} bytes (limit {limit})")]
    PayloadTooLarge {
        /// Observed payload size.
        size: usize,
        /// Enforced ceiling.
        limit: usize,
    },

    /// The anonymizing proxy has not reported full bootstrap; the
    /// fail-closed gate denied an overlay operation.
    #[error("proxy not ready: network egress is fail-closed")]
    ProxyNotReady,

    /// The proxy did not reach 100% bootstrap within the deadline.
    #[error("proxy bootstrap timed out")]
    ProxyBootstrapTimeout,

    /// Neither transport can carry the message right now; the send was
    /// parked in the outbox.
    #[error("no transport available for {peer}")]
    TransportUnavailable {
        /// The unreachable peer.
        peer: String,
    },

    /// The packet fingerprint was already observed. Dropped silently.
    #[error("duplicate packet")]
    Duplicate,

    /// A sender or content token bucket is exhausted. Dropped silently.
    #[error("rate limited")]
    RateLimited,

    /// The input decoded to more than one plausible interpretation; the
    /// caller must resolve, this layer will not guess.
    #[error("ambiguous decode: {0}")]
    DecodeAmbiguity(String),

    /// Radio or relay I/O failure; retried with backoff by the owner.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer identity parse/validation failure.
    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),

    /// Mesh driver reported a failure.
    #[error("mesh error: {0}")]
    Mesh(#[from] MeshError),

    /// Overlay transport failure other than proxy readiness.
    #[error("overlay error: {0}")]
    Overlay(#[from] OverlayError),

    /// Proxy lifecycle failure other than readiness/bootstrap timeout.
    #[error("proxy error: {0}")]
    Proxy(#[from] ProxyError),
}

impl Error {
    /// Whether ingress handling may recover by dropping the input.
    pub fn is_ingress_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MalformedPacket(_)
                | Error::SignatureInvalid { .. }
                | Error::PayloadTooLarge { .. }
                | Error::Duplicate
                | Error::RateLimited
        )
    }

    /// Whether the error should be surfaced to a user that initiated the
    /// failing operation.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            Error::PayloadTooLarge { .. }
                | Error::ProxyNotReady
                | Error::ProxyBootstrapTimeout
                | Error::TransportUnavailable { .. }
        )
    }
}
