//! Peer Identity
//!
//! Normalization between the three identity forms peers are addressed by:
//! 16-hex short routing ids (8-byte digest of a static public key), 64-hex
//! full identity keys (32 bytes), and namespaced overlay addresses. Parsing
//! happens once at the edges; the rest of the crate handles tagged values
//! and validation disappears from the hot path.

use rand::RngCore;
use secp256k1::{Keypair, Parity, Secp256k1, SecretKey, XOnlyPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;
use thiserror::Error;

/// Namespace prefix for overlay-addressed peers.
pub const OVERLAY_PREFIX: &str = "overlay:";

/// Errors related to identity parsing and key handling.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("peer id has invalid length {0} (expected 16 or 64 hex chars)")]
    InvalidLength(usize),

    #[error("peer id is not valid hex")]
    InvalidHex,

    #[error("overlay address must carry a 64-hex x-only pubkey")]
    InvalidOverlayKey,

    #[error("invalid secret key bytes")]
    InvalidSecretKey,
}

/// A peer identity in one of its three address forms.
///
/// `Short` is the 8-byte routing digest used on the mesh wire, `Full` is
/// the 32-byte static identity key, `Overlay` is an x-only overlay pubkey
/// (stored as lowercase hex, displayed with the `overlay:` prefix).
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum PeerId {
    /// 8-byte short routing id.
    Short([u8; 8]),
    /// 32-byte full identity key.
    Full([u8; 32]),
    /// Overlay pubkey, lowercase hex without the prefix.
    Overlay(String),
}

impl PeerId {
    /// Parse a peer id from its string form.
    ///
    /// Accepts 16 hex chars (short), 64 hex chars (full), or
    /// `overlay:<64 hex>`. Input is case-insensitive; the parsed value is
    /// normalized to lowercase.
    pub fn parse(s: &str) -> Result<Self, IdentityError> {
        let s = s.trim();

        if let Some(rest) = s.strip_prefix(OVERLAY_PREFIX) {
            let rest = rest.to_ascii_lowercase();
            if rest.len() != 64 || hex::decode(&rest).is_err() {
                return Err(IdentityError::InvalidOverlayKey);
            }
            return Ok(PeerId::Overlay(rest));
        }

        match s.len() {
            16 => {
                let bytes = hex::decode(s.to_ascii_lowercase())
                    .map_err(|_| IdentityError::InvalidHex)?;
                let mut short = [0u8; 8];
                short.copy_from_slice(&bytes);
                Ok(PeerId::Short(short))
            }
            64 => {
                let bytes = hex::decode(s.to_ascii_lowercase())
                    .map_err(|_| IdentityError::InvalidHex)?;
                let mut full = [0u8; 32];
                full.copy_from_slice(&bytes);
                Ok(PeerId::Full(full))
            }
            len => Err(IdentityError::InvalidLength(len)),
        }
    }

    /// Derive the 8-byte short routing id from a full identity key.
    pub fn short_digest(full_key: &[u8; 32]) -> [u8; 8] {
        let digest = Sha256::digest(full_key);
        let mut short = [0u8; 8];
        short.copy_from_slice(&digest[..8]);
        short
    }

    /// The short routing id for this peer, if derivable.
    ///
    /// `Short` returns itself, `Full` derives the digest, `Overlay` has no
    /// mesh routing id.
    pub fn short_id(&self) -> Option<[u8; 8]> {
        match self {
            PeerId::Short(bytes) => Some(*bytes),
            PeerId::Full(full) => Some(Self::short_digest(full)),
            PeerId::Overlay(_) => None,
        }
    }

    /// Lowercase hex of the short routing id, if derivable.
    pub fn short_hex(&self) -> Option<String> {
        self.short_id().map(hex::encode)
    }

    /// Whether two ids refer to the same mesh peer, comparing under the
    /// short form so a `Full` key matches its own routing digest.
    pub fn same_mesh_peer(&self, other: &PeerId) -> bool {
        match (self.short_id(), other.short_id()) {
            (Some(a), Some(b)) => a == b,
            _ => self == other,
        }
    }

    /// Whether this id addresses the overlay namespace.
    pub fn is_overlay(&self) -> bool {
        matches!(self, PeerId::Overlay(_))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerId::Short(bytes) => write!(f, "{}", hex::encode(bytes)),
            PeerId::Full(bytes) => write!(f, "{}", hex::encode(bytes)),
            PeerId::Overlay(key) => write!(f, "{}{}", OVERLAY_PREFIX, key),
        }
    }
}

/// Signing identity for the overlay transport.
///
/// Wraps a secp256k1 keypair. Per-geohash identities are derived from a
/// root secret so location channels are unlinkable to each other and to
/// the mesh identity.
pub struct OverlayIdentity {
    keypair: Keypair,
    pubkey: XOnlyPublicKey,
}

impl OverlayIdentity {
    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        // A uniformly random 32-byte string is a valid secret key with
        // overwhelming probability; retry on the negligible failure case.
        loop {
            if let Ok(identity) = Self::from_secret_bytes(&secret) {
                return identity;
            }
            rand::thread_rng().fill_bytes(&mut secret);
        }
    }

    /// Construct an identity from raw secret bytes.
    ///
    /// The secret is normalized so the public key has even parity; ECDH
    /// against the x-only form then agrees on both sides of a wrap.
    pub fn from_secret_bytes(secret: &[u8; 32]) -> Result<Self, IdentityError> {
        let secp = Secp256k1::new();
        let mut secret_key =
            SecretKey::from_slice(secret).map_err(|_| IdentityError::InvalidSecretKey)?;
        let keypair = Keypair::from_secret_key(&secp, &secret_key);
        let (_, parity) = keypair.x_only_public_key();
        let keypair = if parity == Parity::Odd {
            secret_key = secret_key.negate();
            Keypair::from_secret_key(&secp, &secret_key)
        } else {
            keypair
        };
        let (pubkey, _) = keypair.x_only_public_key();
        Ok(Self { keypair, pubkey })
    }

    /// Derive the identity used for a specific geohash channel.
    ///
    /// HKDF-SHA256 over the root secret with the normalized geohash as
    /// info. Same (root, geohash) always yields the same identity.
    pub fn derive_for_geohash(
        root_secret: &[u8; 32],
        geohash: &str,
    ) -> Result<Self, IdentityError> {
        let hk = hkdf::Hkdf::<Sha256>::new(Some(b"nightjar-geo-v1"), root_secret);
        let info = geohash.to_ascii_lowercase();
        let mut okm = [0u8; 32];
        hk.expand(info.as_bytes(), &mut okm)
            .map_err(|_| IdentityError::InvalidSecretKey)?;
        Self::from_secret_bytes(&okm)
    }

    /// The x-only public key.
    pub fn pubkey(&self) -> &XOnlyPublicKey {
        &self.pubkey
    }

    /// Lowercase hex of the x-only public key.
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.pubkey.serialize())
    }

    /// The underlying keypair, for event signing.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The secret key, for ECDH key agreement in wrap sealing.
    pub fn secret_key(&self) -> SecretKey {
        self.keypair.secret_key()
    }
}

impl fmt::Debug for OverlayIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OverlayIdentity")
            .field("pubkey", &self.pubkey_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_short() {
        let id = PeerId::parse("A1B2C3D4E5F60718").unwrap();
        assert_eq!(
            id,
            PeerId::Short([0xa1, 0xb2, 0xc3, 0xd4, 0xe5, 0xf6, 0x07, 0x18])
        );
        assert_eq!(id.to_string(), "a1b2c3d4e5f60718");
    }

    #[test]
    fn test_parse_full() {
        let hex64 = "ab".repeat(32);
        let id = PeerId::parse(&hex64).unwrap();
        assert_eq!(id, PeerId::Full([0xab; 32]));
        assert_eq!(id.to_string(), hex64);
    }

    #[test]
    fn test_parse_overlay() {
        let key = "cd".repeat(32);
        let id = PeerId::parse(&format!("overlay:{}", key)).unwrap();
        assert_eq!(id, PeerId::Overlay(key.clone()));
        assert_eq!(id.to_string(), format!("overlay:{}", key));
        assert!(id.is_overlay());
        assert!(id.short_id().is_none());
    }

    #[test]
    fn test_parse_invalid_length() {
        assert!(matches!(
            PeerId::parse("abcdef"),
            Err(IdentityError::InvalidLength(6))
        ));
    }

    #[test]
    fn test_parse_invalid_hex() {
        assert!(matches!(
            PeerId::parse("zzzzzzzzzzzzzzzz"),
            Err(IdentityError::InvalidHex)
        ));
    }

    #[test]
    fn test_parse_invalid_overlay() {
        assert!(matches!(
            PeerId::parse("overlay:tooshort"),
            Err(IdentityError::InvalidOverlayKey)
        ));
    }

    #[test]
    fn test_short_digest_matches_full() {
        let full = [0x42u8; 32];
        let short = PeerId::short_digest(&full);

        let full_id = PeerId::Full(full);
        let short_id = PeerId::Short(short);
        assert!(full_id.same_mesh_peer(&short_id));
        assert!(short_id.same_mesh_peer(&full_id));
        assert_eq!(full_id.short_id(), Some(short));
    }

    #[test]
    fn test_different_peers_do_not_match() {
        let a = PeerId::Full([1u8; 32]);
        let b = PeerId::Full([2u8; 32]);
        assert!(!a.same_mesh_peer(&b));
    }

    #[test]
    fn test_overlay_identity_deterministic() {
        let secret = [7u8; 32];
        let a = OverlayIdentity::from_secret_bytes(&secret).unwrap();
        let b = OverlayIdentity::from_secret_bytes(&secret).unwrap();
        assert_eq!(a.pubkey_hex(), b.pubkey_hex());
    }

    #[test]
    fn test_geohash_derivation_separates_channels() {
        let root = [9u8; 32];
        let a = OverlayIdentity::derive_for_geohash(&root, "u4pruyd").unwrap();
        let b = OverlayIdentity::derive_for_geohash(&root, "u4pruye").unwrap();
        let a2 = OverlayIdentity::derive_for_geohash(&root, "U4PRUYD").unwrap();

        assert_ne!(a.pubkey_hex(), b.pubkey_hex());
        // Case-insensitive on the geohash
        assert_eq!(a.pubkey_hex(), a2.pubkey_hex());
    }
}
