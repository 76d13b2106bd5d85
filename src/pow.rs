//! Proof-of-Work Miner
//!
//! Public overlay events in a geohash channel must present an id with a
//! minimum number of leading zero bits. Finer geohashes address smaller
//! audiences, so their admission price drops:
//!
//! | precision <= 5 | 6 | >= 7 |
//! |----------------|---|------|
//! | 10 bits        | 9 | 8    |
//!
//! Mining iterates a nonce tag from a random 64-bit seed, re-serializing
//! and hashing the canonical event array each step. The miner is
//! CPU-bound and yields to the scheduler every 16 384 iterations so it
//! never holds a worker slot exclusively. It is not cancellable; it is
//! bounded by difficulty.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::overlay::event::{canonical_bytes, nonce_tag};

/// Iterations between cooperative yields.
const YIELD_INTERVAL: u64 = 16_384;

/// Leading-zero count per byte value.
static LZ_TABLE: [u8; 256] = build_lz_table();

const fn build_lz_table() -> [u8; 256] {
    let mut table = [0u8; 256];
    let mut i = 0usize;
    while i < 256 {
        table[i] = (i as u8).leading_zeros() as u8;
        i += 1;
    }
    table
}

/// Count leading zero bits, short-circuiting at the first non-zero byte.
pub fn leading_zero_bits(bytes: &[u8]) -> u32 {
    let mut count = 0u32;
    for &byte in bytes {
        count += LZ_TABLE[byte as usize] as u32;
        if byte != 0 {
            break;
        }
    }
    count
}

/// Required leading-zero bits for a geohash channel (default schedule).
pub fn required_bits(geohash: &str) -> u32 {
    match geohash.len() {
        0..=5 => 10,
        6 => 9,
        _ => 8,
    }
}

/// A mined nonce and the resulting event id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MinedEvent {
    /// The nonce value satisfying the target.
    pub nonce: u64,
    /// Lowercase hex id with at least `target_bits` leading zeros.
    pub id_hex: String,
    /// The full tag list including the nonce tag, ready for signing.
    pub tags: Vec<Vec<String>>,
}

/// Mine a nonce so the event id clears `target_bits` leading zeros.
///
/// Appends `["nonce", "<n>", "<target_bits>"]` to `base_tags` and mutates
/// only that tag while iterating. The returned tag list reproduces the id
/// under independent recomputation.
pub async fn mine_event(
    pubkey_hex: &str,
    created_at: u64,
    kind: u16,
    base_tags: &[Vec<String>],
    content: &str,
    target_bits: u32,
) -> MinedEvent {
    let mut tags: Vec<Vec<String>> = base_tags.to_vec();
    tags.push(nonce_tag(0, target_bits));
    let nonce_index = tags.len() - 1;

    let mut nonce: u64 = rand::thread_rng().r#gen();
    let mut iterations: u64 = 0;

    loop {
        tags[nonce_index][1] = nonce.to_string();
        let bytes = canonical_bytes(pubkey_hex, created_at, kind, &tags, content);
        let id: [u8; 32] = Sha256::digest(&bytes).into();

        if leading_zero_bits(&id) >= target_bits {
            return MinedEvent {
                nonce,
                id_hex: hex::encode(id),
                tags,
            };
        }

        nonce = nonce.wrapping_add(1);
        iterations += 1;
        if iterations % YIELD_INTERVAL == 0 {
            tokio::task::yield_now().await;
        }
    }
}
