//! Favorites store and status events.
//!
//! A favorite mapping is a mutually-confirmed link between a mesh
//! identity and an overlay pubkey. The router reads mappings to pick the
//! overlay transport for offline mesh peers, and subscribes to the typed
//! event channel to flush the outbox when a mapping appears or a peer's
//! keys rotate.
//!
//! Records are keyed by the 8-byte short routing id, so lookups succeed
//! under either the 16-hex short form or the 64-hex full form.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;
use tracing::debug;

use crate::identity::PeerId;

/// Broadcast channel depth for status events.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A stored favorite record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FavoriteRecord {
    /// The peer, in whatever form it was registered under.
    pub peer: PeerId,
    /// Whether the favorite is mutual (both sides confirmed).
    pub is_mutual: bool,
    /// The peer's overlay pubkey (lowercase hex), if known.
    pub overlay_pubkey: Option<String>,
}

/// Emitted whenever a peer's favorite status or overlay mapping changes.
#[derive(Clone, Debug)]
pub struct FavoriteStatusChanged {
    /// The affected peer.
    pub peer: PeerId,
    /// The overlay mapping after the change (None when removed or not
    /// mutual).
    pub mapping: Option<String>,
}

/// The favorites store.
pub struct Favorites {
    records: Mutex<HashMap<[u8; 8], FavoriteRecord>>,
    events: broadcast::Sender<FavoriteStatusChanged>,
}

impl Favorites {
    /// Create an empty store.
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            records: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to status changes.
    pub fn subscribe(&self) -> broadcast::Receiver<FavoriteStatusChanged> {
        self.events.subscribe()
    }

    /// Insert or update a record and emit a status event.
    ///
    /// Key-update events (same peer, new overlay pubkey) flow through
    /// here too; the router re-evaluates the outbox on every event.
    pub fn set(&self, peer: PeerId, is_mutual: bool, overlay_pubkey: Option<String>) {
        let Some(short) = peer.short_id() else {
            debug!(%peer, "Ignoring favorite for overlay-only id");
            return;
        };

        let record = FavoriteRecord {
            peer: peer.clone(),
            is_mutual,
            overlay_pubkey: overlay_pubkey.clone(),
        };
        self.records.lock().unwrap().insert(short, record);

        let mapping = if is_mutual { overlay_pubkey } else { None };
        let _ = self.events.send(FavoriteStatusChanged { peer, mapping });
    }

    /// Remove a record and emit a status event.
    pub fn remove(&self, peer: &PeerId) {
        let Some(short) = peer.short_id() else {
            return;
        };
        if self.records.lock().unwrap().remove(&short).is_some() {
            let _ = self.events.send(FavoriteStatusChanged {
                peer: peer.clone(),
                mapping: None,
            });
        }
    }

    /// The overlay mapping for a peer: present iff the record is mutual
    /// and carries an overlay pubkey. Accepts short or full id forms.
    pub fn overlay_mapping(&self, peer: &PeerId) -> Option<String> {
        let short = peer.short_id()?;
        let records = self.records.lock().unwrap();
        let record = records.get(&short)?;
        if !record.is_mutual {
            return None;
        }
        record.overlay_pubkey.clone()
    }

    /// Look up the full record.
    pub fn get(&self, peer: &PeerId) -> Option<FavoriteRecord> {
        let short = peer.short_id()?;
        self.records.lock().unwrap().get(&short).cloned()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }

    /// Drop every record without emitting events (panic wipe).
    pub fn wipe(&self) {
        self.records.lock().unwrap().clear();
    }
}

impl Default for Favorites {
    fn default() -> Self {
        Self::new()
    }
}
