//! Ingress Rate Limiting
//!
//! Token bucket rate limiting applied at packet ingress, before
//! signature checks or storage. Two keyed bucket sets protect the mesh:
//! per-sender (a chatty or hostile radio neighbor) and per-content
//! (identical payload replayed under rotating sender ids).
//!
//! Exhaustion is a silent drop: rate-limited packets increment a counter
//! and are logged at debug level, never surfaced to the user.

use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Cap on tracked bucket keys per set; oldest keys evict first.
const MAX_TRACKED_KEYS: usize = 1024;

/// Token bucket with fractional refill.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    /// Maximum number of tokens (burst capacity).
    capacity: u32,
    /// Current number of available tokens (fractional during refill).
    tokens: f64,
    /// Tokens added per second.
    refill_rate: f64,
    /// Last time tokens were refilled.
    last_refill: Instant,
}

impl TokenBucket {
    /// Create a token bucket with the given burst capacity and refill rate.
    pub fn with_params(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            tokens: capacity as f64,
            refill_rate,
            last_refill: Instant::now(),
        }
    }

    /// Try to consume one token. Returns false when rate limited.
    pub fn try_acquire(&mut self) -> bool {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current available tokens.
    pub fn tokens(&mut self) -> f64 {
        self.refill();
        self.tokens
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill);
        if elapsed > Duration::ZERO {
            self.tokens =
                (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity as f64);
            self.last_refill = now;
        }
    }
}

/// Keyed bucket set with bounded tracking.
#[derive(Debug)]
struct BucketSet {
    capacity: u32,
    refill_rate: f64,
    buckets: HashMap<[u8; 8], TokenBucket>,
    order: VecDeque<[u8; 8]>,
}

impl BucketSet {
    fn new(capacity: u32, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            buckets: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn try_acquire(&mut self, key: [u8; 8]) -> bool {
        if !self.buckets.contains_key(&key) {
            if self.buckets.len() >= MAX_TRACKED_KEYS {
                if let Some(oldest) = self.order.pop_front() {
                    self.buckets.remove(&oldest);
                }
            }
            self.buckets
                .insert(key, TokenBucket::with_params(self.capacity, self.refill_rate));
            self.order.push_back(key);
        }
        self.buckets
            .get_mut(&key)
            .map(|bucket| bucket.try_acquire())
            .unwrap_or(true)
    }

    fn clear(&mut self) {
        self.buckets.clear();
        self.order.clear();
    }
}

/// Ingress rate limiter: per-sender and per-content buckets.
#[derive(Debug)]
pub struct IngressLimiter {
    senders: BucketSet,
    contents: BucketSet,
}

impl IngressLimiter {
    /// Create a limiter with the given bucket parameters.
    pub fn new(
        sender_burst: u32,
        sender_refill_rate: f64,
        content_burst: u32,
        content_refill_rate: f64,
    ) -> Self {
        Self {
            senders: BucketSet::new(sender_burst, sender_refill_rate),
            contents: BucketSet::new(content_burst, content_refill_rate),
        }
    }

    /// Admit or drop a packet from `sender_id` carrying `payload`.
    ///
    /// Both buckets must have a token; consuming from one but not the
    /// other is fine (the drop already happened).
    pub fn admit(&mut self, sender_id: [u8; 8], payload: &[u8]) -> bool {
        if !self.senders.try_acquire(sender_id) {
            return false;
        }
        self.contents.try_acquire(content_key(payload))
    }

    /// Drop all bucket state.
    pub fn clear(&mut self) {
        self.senders.clear();
        self.contents.clear();
    }
}

/// 8-byte content bucket key: truncated SHA-256 of the payload.
fn content_key(payload: &[u8]) -> [u8; 8] {
    let digest = Sha256::digest(payload);
    let mut key = [0u8; 8];
    key.copy_from_slice(&digest[..8]);
    key
}
