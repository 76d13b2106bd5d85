//! Seen-Set Bloom Filter
//!
//! Rotating (double-buffered) Bloom filter over 16-byte packet
//! fingerprints. Bounds both the false-positive rate and the state size:
//! once the active filter reaches its derived capacity it is replaced by a
//! standby that has been receiving parallel inserts since the halfway
//! mark, so recent fingerprints survive rotation and stale ones age out.
//!
//! ## Parameters
//!
//! From `max_bytes` (default 256) and a target false-positive rate
//! (default 0.01):
//!
//! - `m_bits = max_bytes * 8`
//! - `n = floor(-m_bits * (ln 2)^2 / ln(fpr))` (capacity)
//! - `k = ceil((m_bits / n) * ln 2)` (hash count)
//!
//! ## Hashing
//!
//! Double hashing from two FNV-1a-style 64-bit folds with distinct
//! constants; bit `i` of `k` maps to
//! `((h1 + i*h2) & 0x7fff_ffff_ffff_ffff) mod m_bits`. Bits are stored
//! MSB-first within each byte. This derivation is part of the wire
//! contract: a peer reconstructs the membership predicate from a shipped
//! snapshot and must reach identical verdicts.
//!
//! All operations are total; a single mutex guards rotation state.

use std::fmt;
use std::sync::Mutex;

use crate::wire::Fingerprint;

/// Default filter size in bytes.
pub const DEFAULT_MAX_BYTES: usize = 256;

/// Default target false-positive rate.
pub const DEFAULT_TARGET_FPR: f64 = 0.01;

const FOLD1_INIT: u64 = 0xcbf2_9ce4_8422_2325;
const FOLD1_PRIME: u64 = 0x0000_0100_0000_01b3;
const FOLD2_INIT: u64 = 0x9e37_79b9_7f4a_7c15;
const FOLD2_PRIME: u64 = 0x0000_0100_0000_01b5;

/// FNV-1a-style fold of `data` into a 64-bit hash.
fn fold(data: &[u8], init: u64, prime: u64) -> u64 {
    let mut hash = init;
    for &byte in data {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(prime);
    }
    hash
}

/// Double-hash bit index for hash function `i`.
fn bit_index(h1: u64, h2: u64, i: u32, m_bits: usize) -> usize {
    let combined = h1.wrapping_add((i as u64).wrapping_mul(h2)) & 0x7fff_ffff_ffff_ffff;
    (combined % m_bits as u64) as usize
}

/// Derived optimal capacity for the given size and target FPR.
fn derived_capacity(m_bits: usize, target_fpr: f64) -> usize {
    let ln2 = std::f64::consts::LN_2;
    let n = (-(m_bits as f64) * ln2 * ln2 / target_fpr.ln()).floor() as usize;
    n.max(1)
}

/// Derived hash count for the given size and capacity.
fn derived_hash_count(m_bits: usize, capacity: usize) -> u8 {
    let k = ((m_bits as f64 / capacity as f64) * std::f64::consts::LN_2).ceil();
    (k as u8).max(1)
}

// ============================================================================
// Plain filter
// ============================================================================

/// A fixed-size Bloom filter (one buffer of the rotating pair).
#[derive(Clone, PartialEq, Eq)]
struct Filter {
    bits: Vec<u8>,
    m_bits: usize,
    k: u8,
}

impl Filter {
    fn new(m_bytes: usize, k: u8) -> Self {
        Self {
            bits: vec![0u8; m_bytes],
            m_bits: m_bytes * 8,
            k,
        }
    }

    fn insert(&mut self, fingerprint: &Fingerprint) {
        let data = fingerprint.as_bytes();
        let h1 = fold(data, FOLD1_INIT, FOLD1_PRIME);
        let h2 = fold(data, FOLD2_INIT, FOLD2_PRIME);
        for i in 0..self.k as u32 {
            let index = bit_index(h1, h2, i, self.m_bits);
            // MSB-first within each byte
            self.bits[index / 8] |= 0x80 >> (index % 8);
        }
    }

    fn contains(&self, fingerprint: &Fingerprint) -> bool {
        let data = fingerprint.as_bytes();
        let h1 = fold(data, FOLD1_INIT, FOLD1_PRIME);
        let h2 = fold(data, FOLD2_INIT, FOLD2_PRIME);
        for i in 0..self.k as u32 {
            let index = bit_index(h1, h2, i, self.m_bits);
            if self.bits[index / 8] & (0x80 >> (index % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Snapshot
// ============================================================================

/// A value-typed copy of the active filter, safe to ship over the wire.
///
/// Reconstructs the membership predicate with the same hash derivation as
/// the source filter, so verdicts match the origin byte-for-byte.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BloomSnapshot {
    /// Filter size in bytes.
    pub m_bytes: u16,
    /// Hash count.
    pub k: u8,
    /// Packed bits, MSB-first per byte.
    pub bits: Vec<u8>,
}

impl BloomSnapshot {
    /// Reconstruct a snapshot from received parameters.
    pub fn from_parts(m_bytes: u16, k: u8, bits: Vec<u8>) -> Self {
        Self { m_bytes, k, bits }
    }

    /// Query the snapshot. False positives possible, false negatives not
    /// (for fingerprints inserted before the snapshot was taken).
    pub fn might_contain(&self, fingerprint: &Fingerprint) -> bool {
        let m_bits = self.bits.len() * 8;
        if m_bits == 0 {
            return false;
        }
        let data = fingerprint.as_bytes();
        let h1 = fold(data, FOLD1_INIT, FOLD1_PRIME);
        let h2 = fold(data, FOLD2_INIT, FOLD2_PRIME);
        for i in 0..self.k.max(1) as u32 {
            let index = bit_index(h1, h2, i, m_bits);
            if self.bits[index / 8] & (0x80 >> (index % 8)) == 0 {
                return false;
            }
        }
        true
    }
}

// ============================================================================
// Rotating filter
// ============================================================================

struct Rotation {
    active: Filter,
    standby: Option<Filter>,
    insert_count: usize,
}

/// The rotating seen-set filter.
///
/// At `capacity / 2` insertions a standby filter starts receiving
/// parallel inserts; at `capacity` it is promoted to active and the count
/// restarts. The active filter therefore holds between 50% and 100% of
/// capacity, which keeps the measured FPR at or below the target.
pub struct SeenFilter {
    m_bytes: usize,
    k: u8,
    capacity: usize,
    state: Mutex<Rotation>,
}

impl SeenFilter {
    /// Create a filter with default parameters.
    pub fn new() -> Self {
        Self::with_params(DEFAULT_MAX_BYTES, DEFAULT_TARGET_FPR)
    }

    /// Create a filter with a specific size and target FPR.
    pub fn with_params(max_bytes: usize, target_fpr: f64) -> Self {
        let m_bits = max_bytes * 8;
        let capacity = derived_capacity(m_bits, target_fpr);
        let k = derived_hash_count(m_bits, capacity);
        Self {
            m_bytes: max_bytes,
            k,
            capacity,
            state: Mutex::new(Rotation {
                active: Filter::new(max_bytes, k),
                standby: None,
                insert_count: 0,
            }),
        }
    }

    /// Derived capacity (insertions per rotation).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Derived hash count.
    pub fn hash_count(&self) -> u8 {
        self.k
    }

    /// Filter size in bytes.
    pub fn m_bytes(&self) -> usize {
        self.m_bytes
    }

    /// Insertions since the last rotation.
    pub fn insert_count(&self) -> usize {
        self.state.lock().unwrap().insert_count
    }

    /// Record a fingerprint.
    pub fn insert(&self, fingerprint: &Fingerprint) {
        let mut state = self.state.lock().unwrap();
        state.active.insert(fingerprint);
        if let Some(standby) = state.standby.as_mut() {
            standby.insert(fingerprint);
        }
        state.insert_count += 1;

        if state.insert_count >= self.capacity {
            // Promote: the standby carries the most recent half
            state.active = state
                .standby
                .take()
                .unwrap_or_else(|| Filter::new(self.m_bytes, self.k));
            state.insert_count = 0;
        } else if state.insert_count >= self.capacity / 2 && state.standby.is_none() {
            state.standby = Some(Filter::new(self.m_bytes, self.k));
        }
    }

    /// Query the filter.
    ///
    /// Consults the active filter; on a miss the live standby gets the
    /// final verdict (covers a fingerprint inserted concurrently with a
    /// rotation).
    pub fn might_contain(&self, fingerprint: &Fingerprint) -> bool {
        let state = self.state.lock().unwrap();
        if state.active.contains(fingerprint) {
            return true;
        }
        match &state.standby {
            Some(standby) => standby.contains(fingerprint),
            None => false,
        }
    }

    /// Query-and-record in one step.
    ///
    /// Returns true iff the fingerprint was not already present (first
    /// arrival wins; duplicates return false and are not re-inserted).
    pub fn observe(&self, fingerprint: &Fingerprint) -> bool {
        if self.might_contain(fingerprint) {
            return false;
        }
        self.insert(fingerprint);
        true
    }

    /// Export a value copy of the active filter.
    pub fn snapshot(&self) -> BloomSnapshot {
        let state = self.state.lock().unwrap();
        BloomSnapshot {
            m_bytes: self.m_bytes as u16,
            k: self.k,
            bits: state.active.bits.clone(),
        }
    }

    /// Drop all recorded fingerprints and rotation state.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.active = Filter::new(self.m_bytes, self.k);
        state.standby = None;
        state.insert_count = 0;
    }
}

impl Default for SeenFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SeenFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("SeenFilter")
            .field("m_bytes", &self.m_bytes)
            .field("k", &self.k)
            .field("capacity", &self.capacity)
            .field("insert_count", &state.insert_count)
            .field("standby_live", &state.standby.is_some())
            .finish()
    }
}
