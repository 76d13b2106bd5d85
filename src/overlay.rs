//! Overlay Transport
//!
//! The relay-based message path, reached exclusively through the embedded
//! anonymizing proxy. Every send and every subscription checks the proxy
//! readiness gate first and fails with `ProxyNotReady` while the gate is
//! closed. The fail-closed invariant lives here, not in callers.
//!
//! Public notes go to a geohash channel: signed with an identity derived
//! per-geohash, priced with proof-of-work, published to the relays
//! nearest the cell. Direct messages travel as gift wraps: the envelope
//! is sealed to the recipient's overlay key and signed by a one-shot
//! ephemeral identity, so relays see neither sender nor content.
//!
//! The actual relay WebSocket client is a collaborator behind the
//! [`RelaySink`] trait; this module decides what to publish and where.

pub mod event;
pub mod relay;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use rand::RngCore;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{Parity, PublicKey, SecretKey, XOnlyPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::PowConfig;
use crate::error::Error;
use crate::geohash::{self, GeohashError};
use crate::identity::OverlayIdentity;
use crate::pow;
use crate::proxy::ProxyManager;
use event::{geohash_tag, nickname_tag, recipient_tag};
use relay::RelayDirectory;

pub use event::OverlayEvent;

/// Cap on the recently-processed event id set.
const PROCESSED_EVENT_CAP: usize = 2000;

/// AEAD nonce size for wrap sealing.
const WRAP_NONCE_SIZE: usize = 12;

/// HKDF salt for wrap key derivation.
const WRAP_KDF_SALT: &[u8] = b"nightjar-wrap-v1";

/// Errors from the overlay transport (other than proxy readiness, which
/// is the crate-level `ProxyNotReady`).
#[derive(Debug, Error)]
pub enum OverlayError {
    #[error("relay sink error: {0}")]
    Sink(String),

    #[error("no relays available for geohash {0}")]
    NoRelays(String),

    #[error("wrap seal/unseal failed: {0}")]
    Seal(String),

    #[error("invalid recipient pubkey")]
    InvalidRecipient,

    #[error("geohash error: {0}")]
    Geohash(#[from] GeohashError),
}

/// Subscription filter handed to the relay client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SubscriptionFilter {
    /// Event kinds to match.
    pub kinds: Vec<u16>,
    /// Geohash channel tag, if channel-scoped.
    pub geohash: Option<String>,
    /// Recipient pubkey hex, if addressed.
    pub recipient: Option<String>,
    /// Only events at or after this Unix-seconds time.
    pub since: Option<u64>,
}

/// The relay WebSocket client contract.
///
/// Implementations own connections, per-relay reconnect backoff
/// ([`relay::ReconnectBackoff`]), and delivery of incoming events back to
/// the node. All connections go through the SOCKS proxy; the transport
/// has already checked the readiness gate before calling in.
pub trait RelaySink: Send + Sync {
    /// Publish an event to the given relays.
    fn publish(&self, relays: &[String], event: &OverlayEvent) -> Result<(), OverlayError>;

    /// Open a subscription with a client-assigned id.
    fn subscribe(
        &self,
        subscription_id: &str,
        relays: &[String],
        filter: &SubscriptionFilter,
    ) -> Result<(), OverlayError>;

    /// Close a subscription. Must be synchronous and idempotent.
    fn unsubscribe(&self, subscription_id: &str);
}

/// Plaintext carried inside a gift wrap.
///
/// The sender identifies itself only here, inside the sealed layer; the
/// outer event is signed by a throwaway key.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrapPayload {
    /// Message content.
    pub content: String,
    /// Message id, echoed in acks.
    pub message_id: String,
    /// The real sender's overlay pubkey (lowercase hex).
    pub sender_pubkey: String,
}

/// Bounded insertion-ordered set of processed event ids.
///
/// Prevents double-delivery across overlapping subscriptions (a geohash
/// channel and its parent cell both match the same event).
struct ProcessedSet {
    set: HashSet<String>,
    order: VecDeque<String>,
}

impl ProcessedSet {
    fn new() -> Self {
        Self {
            set: HashSet::new(),
            order: VecDeque::new(),
        }
    }

    /// Record an id; returns false if it was already present.
    fn insert(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        if self.set.len() >= PROCESSED_EVENT_CAP {
            if let Some(oldest) = self.order.pop_front() {
                self.set.remove(&oldest);
            }
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());
        true
    }

    fn clear(&mut self) {
        self.set.clear();
        self.order.clear();
    }
}

/// The overlay transport.
pub struct OverlayTransport {
    proxy: Arc<ProxyManager>,
    sink: Arc<dyn RelaySink>,
    directory: RelayDirectory,
    relay_count: usize,
    /// Stable DM identity (wrap unsealing, acks).
    identity: OverlayIdentity,
    /// Root secret for per-geohash identity derivation.
    root_secret: [u8; 32],
    /// Difficulty schedule for public notes.
    pow: PowConfig,
    processed: Mutex<ProcessedSet>,
    subscriptions: Mutex<HashSet<String>>,
    /// message_id -> sealed event, so a retried send republishes nothing.
    sent_wraps: Mutex<HashMap<String, OverlayEvent>>,
}

impl OverlayTransport {
    /// Create the transport.
    pub fn new(
        proxy: Arc<ProxyManager>,
        sink: Arc<dyn RelaySink>,
        directory: RelayDirectory,
        relay_count: usize,
        pow: PowConfig,
        root_secret: [u8; 32],
    ) -> Result<Self, Error> {
        let identity = OverlayIdentity::from_secret_bytes(&root_secret)?;
        Ok(Self {
            proxy,
            sink,
            directory,
            relay_count,
            identity,
            root_secret,
            pow,
            processed: Mutex::new(ProcessedSet::new()),
            subscriptions: Mutex::new(HashSet::new()),
            sent_wraps: Mutex::new(HashMap::new()),
        })
    }

    /// Our DM pubkey (what peers store as the favorite mapping).
    pub fn dm_pubkey_hex(&self) -> String {
        self.identity.pubkey_hex()
    }

    /// The fail-closed gate. Checked by every send and subscribe.
    fn gate(&self) -> Result<(), Error> {
        if self.proxy.network_permitted() {
            Ok(())
        } else {
            Err(Error::ProxyNotReady)
        }
    }

    /// Relays used for location-less traffic (DMs, acks): a stable slice
    /// of the directory so both sides converge on the same set.
    fn dm_relays(&self) -> Vec<String> {
        // Greenwich center as the conventional anchor for unlocated traffic
        self.directory.closest_to_geohash("gcpuv", self.relay_count)
    }

    // ========================================================================
    // Public geohash notes
    // ========================================================================

    /// Publish a public note in a geohash channel.
    ///
    /// Mines the proof-of-work required for the channel's precision,
    /// signs with the per-geohash identity, and publishes to the nearest
    /// relays. The gate is checked before mining (no wasted work) and
    /// again before the publish (mining takes time).
    pub async fn send_geohash_note(
        &self,
        geohash: &str,
        content: &str,
        nickname: Option<&str>,
    ) -> Result<OverlayEvent, Error> {
        self.gate()?;

        let channel = geohash::normalize(geohash).map_err(OverlayError::Geohash)?;
        let identity = OverlayIdentity::derive_for_geohash(&self.root_secret, &channel)?;

        let mut base_tags = vec![geohash_tag(&channel)];
        if let Some(nickname) = nickname {
            base_tags.push(nickname_tag(nickname));
        }

        let target_bits = self.pow.required_bits(channel.len());
        let created_at = unix_now_secs();
        let mined = pow::mine_event(
            &identity.pubkey_hex(),
            created_at,
            event::kind::GEO_TEXT_NOTE,
            &base_tags,
            content,
            target_bits,
        )
        .await;

        let note = OverlayEvent::build(
            &identity,
            created_at,
            event::kind::GEO_TEXT_NOTE,
            mined.tags,
            content.to_string(),
        );
        debug_assert_eq!(note.id, mined.id_hex);

        let relays = self.directory.closest_to_geohash(&channel, self.relay_count);
        if relays.is_empty() {
            return Err(OverlayError::NoRelays(channel).into());
        }

        self.gate()?;
        self.sink.publish(&relays, &note).map_err(Error::Overlay)?;
        debug!(channel = %channel, id = %note.id, bits = target_bits, "Published geohash note");
        Ok(note)
    }

    // ========================================================================
    // Gift-wrapped direct messages
    // ========================================================================

    /// Send a gift-wrapped direct message.
    ///
    /// Sealed to the recipient's overlay key, signed by a one-shot
    /// ephemeral identity. Resends of the same `message_id` return the
    /// original wrap without republishing.
    pub fn send_private_dm(
        &self,
        content: &str,
        recipient_pubkey: &str,
        message_id: &str,
    ) -> Result<OverlayEvent, Error> {
        self.gate()?;

        if let Some(existing) = self.sent_wraps.lock().unwrap().get(message_id) {
            debug!(message_id, id = %existing.id, "Wrap already sent, deduplicating");
            return Ok(existing.clone());
        }

        let payload = WrapPayload {
            content: content.to_string(),
            message_id: message_id.to_string(),
            sender_pubkey: self.identity.pubkey_hex(),
        };
        let wrap = seal_gift_wrap(recipient_pubkey, &payload, unix_now_secs())?;

        let relays = self.dm_relays();
        self.sink.publish(&relays, &wrap).map_err(Error::Overlay)?;
        self.sent_wraps
            .lock()
            .unwrap()
            .insert(message_id.to_string(), wrap.clone());
        debug!(message_id, id = %wrap.id, "Published gift wrap");
        Ok(wrap)
    }

    /// Unseal an incoming gift wrap addressed to us.
    pub fn unseal_dm(&self, wrap: &OverlayEvent) -> Result<WrapPayload, Error> {
        unseal_gift_wrap(&self.identity, wrap)
    }

    // ========================================================================
    // Acknowledgements
    // ========================================================================

    /// Publish a delivery acknowledgement for a message.
    pub fn send_delivery_ack(
        &self,
        recipient_pubkey: &str,
        message_id: &str,
    ) -> Result<(), Error> {
        self.send_ack(event::kind::DELIVERY_ACK, recipient_pubkey, message_id)
    }

    /// Publish a read acknowledgement for a message.
    pub fn send_read_ack(&self, recipient_pubkey: &str, message_id: &str) -> Result<(), Error> {
        self.send_ack(event::kind::READ_ACK, recipient_pubkey, message_id)
    }

    fn send_ack(&self, kind: u16, recipient_pubkey: &str, message_id: &str) -> Result<(), Error> {
        self.gate()?;
        let ack = OverlayEvent::build(
            &self.identity,
            unix_now_secs(),
            kind,
            vec![recipient_tag(recipient_pubkey)],
            message_id.to_string(),
        );
        self.sink
            .publish(&self.dm_relays(), &ack)
            .map_err(Error::Overlay)
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    /// Subscribe to a geohash channel's public notes.
    pub fn subscribe_geohash(&self, subscription_id: &str, geohash: &str) -> Result<(), Error> {
        self.gate()?;
        let channel = geohash::normalize(geohash).map_err(OverlayError::Geohash)?;

        let mut subscriptions = self.subscriptions.lock().unwrap();
        if !subscriptions.insert(subscription_id.to_string()) {
            return Ok(());
        }
        drop(subscriptions);

        let relays = self.directory.closest_to_geohash(&channel, self.relay_count);
        let filter = SubscriptionFilter {
            kinds: vec![event::kind::GEO_TEXT_NOTE],
            geohash: Some(channel),
            ..Default::default()
        };
        self.sink
            .subscribe(subscription_id, &relays, &filter)
            .map_err(Error::Overlay)
    }

    /// Subscribe to wraps and acks addressed to our DM key.
    pub fn subscribe_dms(&self, subscription_id: &str) -> Result<(), Error> {
        self.gate()?;

        let mut subscriptions = self.subscriptions.lock().unwrap();
        if !subscriptions.insert(subscription_id.to_string()) {
            return Ok(());
        }
        drop(subscriptions);

        let filter = SubscriptionFilter {
            kinds: vec![
                event::kind::GIFT_WRAP,
                event::kind::DELIVERY_ACK,
                event::kind::READ_ACK,
            ],
            recipient: Some(self.identity.pubkey_hex()),
            ..Default::default()
        };
        self.sink
            .subscribe(subscription_id, &self.dm_relays(), &filter)
            .map_err(Error::Overlay)
    }

    /// Close a subscription. Idempotent; unknown ids are a no-op.
    pub fn unsubscribe(&self, subscription_id: &str) {
        if self.subscriptions.lock().unwrap().remove(subscription_id) {
            self.sink.unsubscribe(subscription_id);
        }
    }

    // ========================================================================
    // Ingress
    // ========================================================================

    /// Admit an incoming event: verify signature and dedup by id.
    ///
    /// Returns false for invalid events and for ids already processed
    /// (overlapping subscriptions deliver the same event more than once).
    pub fn admit_event(&self, incoming: &OverlayEvent) -> bool {
        if !incoming.verify() {
            debug!(id = %incoming.id, "Dropping overlay event with bad signature");
            return false;
        }
        self.processed.lock().unwrap().insert(&incoming.id)
    }

    /// Reset processed ids and wrap dedup state (panic wipe).
    pub fn wipe(&self) {
        self.processed.lock().unwrap().clear();
        self.sent_wraps.lock().unwrap().clear();
        info!("Overlay transport state wiped");
    }
}

impl crate::router::OverlaySender for OverlayTransport {
    fn send_private_message(
        &self,
        content: &str,
        recipient_pubkey: &str,
        message_id: &str,
    ) -> Result<(), Error> {
        self.send_private_dm(content, recipient_pubkey, message_id)
            .map(|_| ())
    }

    fn send_delivery_ack(&self, recipient_pubkey: &str, message_id: &str) -> Result<(), Error> {
        OverlayTransport::send_delivery_ack(self, recipient_pubkey, message_id)
    }

    fn send_read_receipt(&self, recipient_pubkey: &str, message_id: &str) -> Result<(), Error> {
        self.send_read_ack(recipient_pubkey, message_id)
    }
}

// ============================================================================
// Wrap sealing
// ============================================================================

/// ECDH + HKDF conversation key between a secret and an x-only pubkey.
fn conversation_key(secret: &SecretKey, their_pubkey_hex: &str) -> Result<[u8; 32], OverlayError> {
    let bytes = hex::decode(their_pubkey_hex).map_err(|_| OverlayError::InvalidRecipient)?;
    let xonly = XOnlyPublicKey::from_slice(&bytes).map_err(|_| OverlayError::InvalidRecipient)?;
    let full = PublicKey::from_x_only_public_key(xonly, Parity::Even);
    let shared = SharedSecret::new(&full, secret);

    let hk = hkdf::Hkdf::<Sha256>::new(Some(WRAP_KDF_SALT), &shared.secret_bytes());
    let mut key = [0u8; 32];
    hk.expand(b"", &mut key)
        .map_err(|_| OverlayError::Seal("kdf expand failed".into()))?;
    Ok(key)
}

/// Seal a payload to a recipient, signing with a fresh ephemeral key.
fn seal_gift_wrap(
    recipient_pubkey: &str,
    payload: &WrapPayload,
    created_at: u64,
) -> Result<OverlayEvent, Error> {
    let ephemeral = OverlayIdentity::generate();
    let key = conversation_key(&ephemeral.secret_key(), recipient_pubkey)?;

    let plaintext =
        serde_json::to_vec(payload).map_err(|e| OverlayError::Seal(e.to_string()))?;

    let mut nonce = [0u8; WRAP_NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext.as_slice())
        .map_err(|_| OverlayError::Seal("encryption failed".into()))?;

    let mut sealed = Vec::with_capacity(WRAP_NONCE_SIZE + ciphertext.len());
    sealed.extend_from_slice(&nonce);
    sealed.extend_from_slice(&ciphertext);

    Ok(OverlayEvent::build(
        &ephemeral,
        created_at,
        event::kind::GIFT_WRAP,
        vec![recipient_tag(recipient_pubkey)],
        hex::encode(sealed),
    ))
}

/// Unseal a wrap addressed to `identity`.
fn unseal_gift_wrap(
    identity: &OverlayIdentity,
    wrap: &OverlayEvent,
) -> Result<WrapPayload, Error> {
    let key = conversation_key(&identity.secret_key(), &wrap.pubkey)?;

    let sealed = hex::decode(&wrap.content)
        .map_err(|_| OverlayError::Seal("wrap content is not hex".into()))?;
    if sealed.len() < WRAP_NONCE_SIZE {
        return Err(OverlayError::Seal("wrap too short".into()).into());
    }
    let (nonce, ciphertext) = sealed.split_at(WRAP_NONCE_SIZE);

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| OverlayError::Seal("decryption failed".into()))?;

    serde_json::from_slice(&plaintext).map_err(|e| OverlayError::Seal(e.to_string()).into())
}

/// Current Unix time in seconds.
fn unix_now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OverlayConfig, PolicyConfig, PowConfig};

    /// Spy sink recording every call.
    #[derive(Default)]
    struct SpySink {
        published: Mutex<Vec<(Vec<String>, OverlayEvent)>>,
        subscribed: Mutex<Vec<String>>,
        unsubscribed: Mutex<Vec<String>>,
    }

    impl RelaySink for SpySink {
        fn publish(&self, relays: &[String], event: &OverlayEvent) -> Result<(), OverlayError> {
            self.published
                .lock()
                .unwrap()
                .push((relays.to_vec(), event.clone()));
            Ok(())
        }

        fn subscribe(
            &self,
            subscription_id: &str,
            _relays: &[String],
            _filter: &SubscriptionFilter,
        ) -> Result<(), OverlayError> {
            self.subscribed
                .lock()
                .unwrap()
                .push(subscription_id.to_string());
            Ok(())
        }

        fn unsubscribe(&self, subscription_id: &str) {
            self.unsubscribed
                .lock()
                .unwrap()
                .push(subscription_id.to_string());
        }
    }

    fn make_transport(fail_closed: bool) -> (Arc<OverlayTransport>, Arc<SpySink>) {
        let overlay_config = OverlayConfig::default();
        let policy = PolicyConfig { fail_closed };
        let proxy = Arc::new(ProxyManager::new(&overlay_config, &policy));
        let sink = Arc::new(SpySink::default());
        let transport = OverlayTransport::new(
            proxy,
            sink.clone() as Arc<dyn RelaySink>,
            RelayDirectory::embedded(),
            5,
            PowConfig::default(),
            [42u8; 32],
        )
        .unwrap();
        (Arc::new(transport), sink)
    }

    #[tokio::test]
    async fn test_fail_closed_gate_blocks_all_sends() {
        // Proxy Off with fail-closed policy: gate denies everything
        let (transport, sink) = make_transport(true);

        let result = transport.send_geohash_note("u4pruyd", "hello", None).await;
        assert!(matches!(result, Err(Error::ProxyNotReady)));

        let result = transport.send_private_dm("hi", &"ab".repeat(32), "mid-1");
        assert!(matches!(result, Err(Error::ProxyNotReady)));

        let result = transport.send_delivery_ack(&"ab".repeat(32), "mid-1");
        assert!(matches!(result, Err(Error::ProxyNotReady)));

        let result = transport.subscribe_geohash("sub-1", "u4pruyd");
        assert!(matches!(result, Err(Error::ProxyNotReady)));

        // The spy observed zero network activity
        assert!(sink.published.lock().unwrap().is_empty());
        assert!(sink.subscribed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_geohash_note_mined_and_published() {
        let (transport, sink) = make_transport(false);

        let note = transport
            .send_geohash_note("u4pruydqqvj", "hello", Some("nick"))
            .await
            .unwrap();

        assert!(note.verify());
        assert_eq!(note.tag_value("g"), Some("u4pruydqqvj"));
        assert_eq!(note.tag_value("n"), Some("nick"));
        // PoW satisfied for precision >= 7
        let id = hex::decode(&note.id).unwrap();
        assert!(pow::leading_zero_bits(&id) >= 8);

        let published = sink.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0.len(), 5);
        assert!(published[0].0.iter().all(|r| r.starts_with("wss://")));
    }

    #[test]
    fn test_dm_wrap_roundtrip() {
        let (transport, sink) = make_transport(false);
        let recipient = OverlayIdentity::from_secret_bytes(&[7u8; 32]).unwrap();

        let wrap = transport
            .send_private_dm("secret hello", &recipient.pubkey_hex(), "mid-9")
            .unwrap();
        assert_eq!(wrap.kind, event::kind::GIFT_WRAP);
        assert!(wrap.verify());
        // Relays see only sealed hex, not the content
        assert!(!wrap.content.contains("secret"));

        let payload = unseal_gift_wrap(&recipient, &wrap).unwrap();
        assert_eq!(payload.content, "secret hello");
        assert_eq!(payload.message_id, "mid-9");

        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_dm_dedup_by_message_id() {
        let (transport, sink) = make_transport(false);
        let recipient = OverlayIdentity::from_secret_bytes(&[13u8; 32])
            .unwrap()
            .pubkey_hex();

        let first = transport.send_private_dm("hi", &recipient, "mid-1").unwrap();
        let second = transport.send_private_dm("hi", &recipient, "mid-1").unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(sink.published.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_wrap_not_unsealable_by_third_party() {
        let (transport, _sink) = make_transport(false);
        let recipient = OverlayIdentity::from_secret_bytes(&[8u8; 32]).unwrap();
        let eavesdropper = OverlayIdentity::from_secret_bytes(&[9u8; 32]).unwrap();

        let wrap = transport
            .send_private_dm("for your eyes", &recipient.pubkey_hex(), "mid-2")
            .unwrap();

        assert!(unseal_gift_wrap(&recipient, &wrap).is_ok());
        assert!(unseal_gift_wrap(&eavesdropper, &wrap).is_err());
    }

    #[test]
    fn test_subscribe_unsubscribe_idempotent() {
        let (transport, sink) = make_transport(false);

        transport.subscribe_geohash("sub-1", "ezs42").unwrap();
        // Duplicate subscribe with the same id is a no-op
        transport.subscribe_geohash("sub-1", "ezs42").unwrap();
        assert_eq!(sink.subscribed.lock().unwrap().len(), 1);

        transport.unsubscribe("sub-1");
        transport.unsubscribe("sub-1");
        transport.unsubscribe("never-existed");
        assert_eq!(sink.unsubscribed.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_admit_event_dedups_by_id() {
        let (transport, _sink) = make_transport(false);
        let identity = OverlayIdentity::from_secret_bytes(&[11u8; 32]).unwrap();
        let incoming = OverlayEvent::build(
            &identity,
            1_700_000_000,
            event::kind::GEO_TEXT_NOTE,
            vec![geohash_tag("ezs42")],
            "dup me".to_string(),
        );

        assert!(transport.admit_event(&incoming));
        assert!(!transport.admit_event(&incoming));
    }

    #[test]
    fn test_admit_event_rejects_tampered() {
        let (transport, _sink) = make_transport(false);
        let identity = OverlayIdentity::from_secret_bytes(&[12u8; 32]).unwrap();
        let mut incoming = OverlayEvent::build(
            &identity,
            1_700_000_000,
            event::kind::GEO_TEXT_NOTE,
            vec![],
            "real".to_string(),
        );
        incoming.content = "forged".to_string();

        assert!(!transport.admit_event(&incoming));
    }

    #[test]
    fn test_processed_set_cap() {
        let mut set = ProcessedSet::new();
        for i in 0..(PROCESSED_EVENT_CAP + 100) {
            assert!(set.insert(&format!("event-{}", i)));
        }
        assert_eq!(set.set.len(), PROCESSED_EVENT_CAP);
        // Oldest aged out, newest retained
        assert!(!set.set.contains("event-0"));
        assert!(set.set.contains(&format!("event-{}", PROCESSED_EVENT_CAP + 99)));
    }

    #[test]
    fn test_wipe_clears_dedup_state() {
        let (transport, sink) = make_transport(false);
        let recipient = OverlayIdentity::from_secret_bytes(&[14u8; 32])
            .unwrap()
            .pubkey_hex();
        transport.send_private_dm("x", &recipient, "mid-3").unwrap();

        transport.wipe();
        // Same message id publishes again after wipe
        transport.send_private_dm("x", &recipient, "mid-3").unwrap();
        assert_eq!(sink.published.lock().unwrap().len(), 2);
    }
}
