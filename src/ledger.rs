//! Persisted small state: read receipts and geohash bookmarks.
//!
//! Both stores are JSON arrays on disk, loaded once at startup and
//! rewritten atomically (temp file + rename) on change. Reads take a
//! shared lock, writes an exclusive one; writers are rare (user actions),
//! readers are the hot path.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use tracing::{debug, warn};

use crate::geohash;

/// Write a JSON list atomically next to its final path.
fn persist_list(path: &Path, items: &[String]) -> io::Result<()> {
    let json = serde_json::to_vec(items)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

/// Load a JSON list, treating a missing file as empty.
fn load_list(path: &Path) -> Vec<String> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|error| {
            warn!(path = %path.display(), %error, "Corrupt ledger file, starting empty");
            Vec::new()
        }),
        Err(_) => Vec::new(),
    }
}

struct LedgerInner {
    order: Vec<String>,
    set: HashSet<String>,
}

/// Ledger of message ids this device has sent read receipts for.
///
/// Keeps receipts idempotent across reconnects: a message re-delivered
/// via gossip replay does not trigger a second receipt.
pub struct ReceiptLedger {
    path: Option<PathBuf>,
    inner: RwLock<LedgerInner>,
}

impl ReceiptLedger {
    /// In-memory ledger (tests, ephemeral profiles).
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            inner: RwLock::new(LedgerInner {
                order: Vec::new(),
                set: HashSet::new(),
            }),
        }
    }

    /// Ledger backed by a JSON file; loads existing content.
    pub fn load(path: PathBuf) -> Self {
        let order = load_list(&path);
        let set = order.iter().cloned().collect();
        debug!(path = %path.display(), count = order.len(), "Loaded receipt ledger");
        Self {
            path: Some(path),
            inner: RwLock::new(LedgerInner { order, set }),
        }
    }

    /// Record a receipt. Returns true if it was new; persists on change.
    pub fn mark_read(&self, message_id: &str) -> bool {
        let mut inner = self.inner.write().unwrap();
        if !inner.set.insert(message_id.to_string()) {
            return false;
        }
        inner.order.push(message_id.to_string());
        if let Some(path) = &self.path {
            if let Err(error) = persist_list(path, &inner.order) {
                warn!(%error, "Failed to persist receipt ledger");
            }
        }
        true
    }

    /// Whether a receipt was already sent for this message.
    pub fn is_read(&self, message_id: &str) -> bool {
        self.inner.read().unwrap().set.contains(message_id)
    }

    /// Number of recorded receipts.
    pub fn len(&self) -> usize {
        self.inner.read().unwrap().order.len()
    }

    /// Whether the ledger is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Ordered list of bookmarked geohash channels, normalized lowercase.
pub struct BookmarkStore {
    path: Option<PathBuf>,
    bookmarks: RwLock<Vec<String>>,
}

impl BookmarkStore {
    /// In-memory store.
    pub fn ephemeral() -> Self {
        Self {
            path: None,
            bookmarks: RwLock::new(Vec::new()),
        }
    }

    /// Store backed by a JSON file; invalid entries are dropped at load.
    pub fn load(path: PathBuf) -> Self {
        let bookmarks = load_list(&path)
            .into_iter()
            .filter_map(|entry| geohash::normalize(&entry).ok())
            .collect();
        Self {
            path: Some(path),
            bookmarks: RwLock::new(bookmarks),
        }
    }

    /// Add a bookmark. Returns false for duplicates or invalid geohashes.
    pub fn add(&self, raw: &str) -> bool {
        let Ok(channel) = geohash::normalize(raw) else {
            return false;
        };
        let mut bookmarks = self.bookmarks.write().unwrap();
        if bookmarks.contains(&channel) {
            return false;
        }
        bookmarks.push(channel);
        self.persist(&bookmarks);
        true
    }

    /// Remove a bookmark. Returns true if it was present.
    pub fn remove(&self, raw: &str) -> bool {
        let Ok(channel) = geohash::normalize(raw) else {
            return false;
        };
        let mut bookmarks = self.bookmarks.write().unwrap();
        let before = bookmarks.len();
        bookmarks.retain(|entry| entry != &channel);
        let removed = bookmarks.len() != before;
        if removed {
            self.persist(&bookmarks);
        }
        removed
    }

    /// All bookmarks in insertion order.
    pub fn list(&self) -> Vec<String> {
        self.bookmarks.read().unwrap().clone()
    }

    fn persist(&self, bookmarks: &[String]) {
        if let Some(path) = &self.path {
            if let Err(error) = persist_list(path, bookmarks) {
                warn!(%error, "Failed to persist bookmarks");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("nightjar-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_mark_read_idempotent() {
        let ledger = ReceiptLedger::ephemeral();
        assert!(ledger.mark_read("mid-1"));
        assert!(!ledger.mark_read("mid-1"));
        assert!(ledger.is_read("mid-1"));
        assert!(!ledger.is_read("mid-2"));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_ledger_survives_reload() {
        let path = temp_path("receipts");
        {
            let ledger = ReceiptLedger::load(path.clone());
            ledger.mark_read("mid-a");
            ledger.mark_read("mid-b");
        }
        let reloaded = ReceiptLedger::load(path.clone());
        assert!(reloaded.is_read("mid-a"));
        assert!(reloaded.is_read("mid-b"));
        assert_eq!(reloaded.len(), 2);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_corrupt_ledger_starts_empty() {
        let path = temp_path("corrupt");
        std::fs::write(&path, b"not json at all").unwrap();
        let ledger = ReceiptLedger::load(path.clone());
        assert!(ledger.is_empty());
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn test_bookmarks_normalize_and_dedup() {
        let store = BookmarkStore::ephemeral();
        assert!(store.add("U4PRUYD"));
        assert!(!store.add("u4pruyd"));
        assert!(!store.add("not a geohash!"));
        assert_eq!(store.list(), vec!["u4pruyd"]);
    }

    #[test]
    fn test_bookmarks_remove() {
        let store = BookmarkStore::ephemeral();
        store.add("ezs42");
        assert!(store.remove("EZS42"));
        assert!(!store.remove("ezs42"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn test_bookmarks_reload_drops_invalid() {
        let path = temp_path("bookmarks");
        std::fs::write(&path, br#"["ezs42", "INVALID!", "u4pruyd"]"#).unwrap();
        let store = BookmarkStore::load(path.clone());
        assert_eq!(store.list(), vec!["ezs42", "u4pruyd"]);
        std::fs::remove_file(&path).ok();
    }
}
