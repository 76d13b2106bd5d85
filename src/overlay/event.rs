//! Overlay event type and canonical serialization.
//!
//! An overlay event's id is the SHA-256 of the canonical JSON array
//! `[0, pubkey_hex, created_at, kind, tags, content]`: compact encoding,
//! no escaped slashes. That exact byte sequence is also what the
//! proof-of-work miner iterates, so the serializer lives here and is the
//! single source of truth for both.

use secp256k1::schnorr::Signature;
use secp256k1::{Keypair, Message, Secp256k1, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

use crate::identity::OverlayIdentity;

/// Overlay event kind registry.
pub mod kind {
    /// Ephemeral public text note in a geohash channel.
    pub const GEO_TEXT_NOTE: u16 = 20000;
    /// Gift-wrapped direct message envelope.
    pub const GIFT_WRAP: u16 = 1059;
    /// Delivery acknowledgement (ephemeral, addressed).
    pub const DELIVERY_ACK: u16 = 21001;
    /// Read acknowledgement (ephemeral, addressed).
    pub const READ_ACK: u16 = 21002;
}

/// A signed overlay event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlayEvent {
    /// Lowercase hex SHA-256 of the canonical serialization.
    pub id: String,
    /// Lowercase hex x-only pubkey of the author.
    pub pubkey: String,
    /// Unix seconds at creation.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Tag lists; each tag is a list of strings.
    pub tags: Vec<Vec<String>>,
    /// Event content.
    pub content: String,
    /// Lowercase hex Schnorr signature over the id.
    pub sig: String,
}

/// Canonical serialization bytes for id computation and PoW mining.
pub fn canonical_bytes(
    pubkey_hex: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Vec<u8> {
    let value = json!([0, pubkey_hex, created_at, kind, tags, content]);
    // serde_json compact encoding does not escape slashes, which is the
    // canonical form peers hash
    serde_json::to_vec(&value).expect("canonical event array always serializes")
}

/// Compute the event id digest.
pub fn compute_id(
    pubkey_hex: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> [u8; 32] {
    let bytes = canonical_bytes(pubkey_hex, created_at, kind, tags, content);
    Sha256::digest(&bytes).into()
}

impl OverlayEvent {
    /// Build and sign an event with the given identity.
    pub fn build(
        identity: &OverlayIdentity,
        created_at: u64,
        kind: u16,
        tags: Vec<Vec<String>>,
        content: String,
    ) -> Self {
        let pubkey = identity.pubkey_hex();
        let id_bytes = compute_id(&pubkey, created_at, kind, &tags, &content);
        let sig = sign_id(identity.keypair(), id_bytes);
        Self {
            id: hex::encode(id_bytes),
            pubkey,
            created_at,
            kind,
            tags,
            content,
            sig,
        }
    }

    /// Recompute the id from the carried fields.
    pub fn recompute_id(&self) -> [u8; 32] {
        compute_id(
            &self.pubkey,
            self.created_at,
            self.kind,
            &self.tags,
            &self.content,
        )
    }

    /// Verify id integrity and the Schnorr signature.
    pub fn verify(&self) -> bool {
        let id_bytes = self.recompute_id();
        if hex::encode(id_bytes) != self.id {
            return false;
        }

        let Ok(pubkey_bytes) = hex::decode(&self.pubkey) else {
            return false;
        };
        let Ok(pubkey) = XOnlyPublicKey::from_slice(&pubkey_bytes) else {
            return false;
        };
        let Ok(sig_bytes) = hex::decode(&self.sig) else {
            return false;
        };
        let Ok(signature) = Signature::from_slice(&sig_bytes) else {
            return false;
        };

        let secp = Secp256k1::verification_only();
        let message = Message::from_digest(id_bytes);
        secp.verify_schnorr(&signature, &message, &pubkey).is_ok()
    }

    /// First value of the named tag, if present.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(name))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }
}

/// Sign an event id, returning lowercase hex.
fn sign_id(keypair: &Keypair, id_bytes: [u8; 32]) -> String {
    let secp = Secp256k1::new();
    let message = Message::from_digest(id_bytes);
    let signature = secp.sign_schnorr(&message, keypair);
    hex::encode(signature.serialize())
}

/// Build the geohash channel tag `["g", <geohash>]`.
pub fn geohash_tag(geohash: &str) -> Vec<String> {
    vec!["g".to_string(), geohash.to_string()]
}

/// Build the nickname tag `["n", <nickname>]`.
pub fn nickname_tag(nickname: &str) -> Vec<String> {
    vec!["n".to_string(), nickname.to_string()]
}

/// Build the recipient tag `["p", <pubkey hex>]`.
pub fn recipient_tag(pubkey_hex: &str) -> Vec<String> {
    vec!["p".to_string(), pubkey_hex.to_string()]
}

/// Build the PoW nonce tag `["nonce", <n>, <target_bits>]`.
pub fn nonce_tag(nonce: u64, target_bits: u32) -> Vec<String> {
    vec![
        "nonce".to_string(),
        nonce.to_string(),
        target_bits.to_string(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_bytes_exact() {
        let tags = vec![geohash_tag("u4pruyd")];
        let bytes = canonical_bytes("aa", 1_700_000_000, 20000, &tags, "hi \"there\"");
        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            r#"[0,"aa",1700000000,20000,[["g","u4pruyd"]],"hi \"there\""]"#
        );
    }

    #[test]
    fn test_canonical_bytes_do_not_escape_slashes() {
        let bytes = canonical_bytes("aa", 1, 1, &[], "a/b");
        assert_eq!(String::from_utf8(bytes).unwrap(), r#"[0,"aa",1,1,[],"a/b"]"#);
    }

    #[test]
    fn test_id_changes_with_any_field() {
        let base = compute_id("aa", 1, 1, &[], "x");
        assert_ne!(compute_id("ab", 1, 1, &[], "x"), base);
        assert_ne!(compute_id("aa", 2, 1, &[], "x"), base);
        assert_ne!(compute_id("aa", 1, 2, &[], "x"), base);
        assert_ne!(compute_id("aa", 1, 1, &[vec!["t".into()]], "x"), base);
        assert_ne!(compute_id("aa", 1, 1, &[], "y"), base);
    }

    #[test]
    fn test_build_and_verify() {
        let identity = OverlayIdentity::from_secret_bytes(&[3u8; 32]).unwrap();
        let event = OverlayEvent::build(
            &identity,
            1_700_000_000,
            kind::GEO_TEXT_NOTE,
            vec![geohash_tag("ezs42")],
            "hello overlay".to_string(),
        );

        assert!(event.verify());
        assert_eq!(event.tag_value("g"), Some("ezs42"));
        assert_eq!(event.pubkey, identity.pubkey_hex());
    }

    #[test]
    fn test_tampered_event_fails_verify() {
        let identity = OverlayIdentity::from_secret_bytes(&[4u8; 32]).unwrap();
        let mut event = OverlayEvent::build(
            &identity,
            1_700_000_000,
            kind::GEO_TEXT_NOTE,
            vec![],
            "original".to_string(),
        );

        event.content = "tampered".to_string();
        assert!(!event.verify());
    }

    #[test]
    fn test_event_json_roundtrip() {
        let identity = OverlayIdentity::from_secret_bytes(&[5u8; 32]).unwrap();
        let event = OverlayEvent::build(
            &identity,
            1_700_000_001,
            kind::GIFT_WRAP,
            vec![recipient_tag("ab".repeat(32).as_str())],
            "sealed".to_string(),
        );

        let json = serde_json::to_string(&event).unwrap();
        let back: OverlayEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
        assert!(back.verify());
    }
}
