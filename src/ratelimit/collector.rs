//! Leaky bucket collector.
//!
//! A collector holds one bucket per peer key. Each bucket starts full at
//! `capacity` tokens, loses tokens when cost is added and regains them at
//! `rate` tokens per second, never beyond `capacity`.

use std::collections::HashMap;
use std::time::Instant;

/// Per-peer token state.
#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Tokens at `updated`. Negative when cost was added without a check.
    tokens: f64,
    updated: Instant,
}

/// A leaky bucket collector keyed by peer identity.
#[derive(Debug)]
pub struct Collector {
    /// Tokens regained per second
    rate: f64,
    /// Maximum burst
    capacity: i64,
    buckets: HashMap<String, Bucket>,
    freed: bool,
}

impl Collector {
    /// Create a collector that refills `rate` tokens per second up to `capacity`.
    pub fn new(rate: f64, capacity: i64) -> Self {
        debug_assert!(capacity >= 1, "collector capacity must be at least 1");
        debug_assert!(rate > 0.0, "collector rate must be positive");
        Self {
            rate,
            capacity,
            buckets: HashMap::new(),
            freed: false,
        }
    }

    pub fn capacity(&self) -> i64 {
        self.capacity
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    /// Tokens currently available to `key`.
    pub fn remaining(&self, key: &str) -> i64 {
        self.remaining_at(key, Instant::now())
    }

    /// Deduct `amount` tokens from `key`, returning what is left.
    pub fn add(&mut self, key: &str, amount: i64) -> i64 {
        self.add_at(key, amount, Instant::now())
    }

    /// Drop every bucket that has refilled to capacity.
    ///
    /// A full bucket is indistinguishable from an absent one, so this only
    /// reclaims memory.
    pub fn prune(&mut self) -> usize {
        self.prune_at(Instant::now())
    }

    /// Number of peers with a tracked bucket.
    pub fn peer_count(&self) -> usize {
        self.buckets.len()
    }

    /// Release every bucket. Must be called at most once.
    pub fn free(&mut self) {
        debug_assert!(!self.freed, "collector freed twice");
        self.buckets.clear();
        self.buckets.shrink_to_fit();
        self.freed = true;
    }

    pub fn is_freed(&self) -> bool {
        self.freed
    }

    pub(crate) fn remaining_at(&self, key: &str, now: Instant) -> i64 {
        match self.buckets.get(key) {
            Some(bucket) => self.level(bucket, now).floor() as i64,
            None => self.capacity,
        }
    }

    pub(crate) fn add_at(&mut self, key: &str, amount: i64, now: Instant) -> i64 {
        let capacity = self.capacity as f64;
        let rate = self.rate;
        let bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: capacity,
            updated: now,
        });

        let level = refill(bucket, rate, capacity, now);
        bucket.tokens = level - amount as f64;
        bucket.updated = now;
        bucket.tokens.floor() as i64
    }

    pub(crate) fn prune_at(&mut self, now: Instant) -> usize {
        let capacity = self.capacity as f64;
        let rate = self.rate;
        let before = self.buckets.len();
        self.buckets
            .retain(|_, bucket| refill(bucket, rate, capacity, now) < capacity);
        before - self.buckets.len()
    }

    fn level(&self, bucket: &Bucket, now: Instant) -> f64 {
        refill(bucket, self.rate, self.capacity as f64, now)
    }
}

/// Tokens in `bucket` at `now`, capped at `capacity`.
fn refill(bucket: &Bucket, rate: f64, capacity: f64, now: Instant) -> f64 {
    let elapsed = now.saturating_duration_since(bucket.updated).as_secs_f64();
    (bucket.tokens + elapsed * rate).min(capacity)
}
