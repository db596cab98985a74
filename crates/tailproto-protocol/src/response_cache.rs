//! Short-TTL cache of encoded responses for idempotent retries.
//!
//! Keyed by `(authKeyId, requestId)`. A retransmitted request gets the
//! byte-identical frame that answered the first attempt, and the
//! application handler runs once.
//!
//! Implementation: `HashMap` for lookup + `VecDeque` for FIFO eviction.
//! Entries also expire after a TTL; expired entries are dropped lazily
//! from the front of the queue.

use std::collections::{HashMap, VecDeque};

use tailproto_types::Timestamp;

/// Cache key: hex key fingerprint and request id.
pub type ResponseKey = (String, String);

struct Entry {
    frame: Vec<u8>,
    inserted_at: Timestamp,
}

/// Bounded FIFO + TTL cache of response frames.
pub struct ResponseCache {
    entries: HashMap<ResponseKey, Entry>,
    order: VecDeque<ResponseKey>,
    capacity: usize,
    ttl_secs: u64,
}

impl ResponseCache {
    /// Creates a cache. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize, ttl_secs: u64) -> Self {
        let cap = capacity.max(1);
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: cap,
            ttl_secs,
        }
    }

    /// Returns the cached frame if present and not expired.
    pub fn get(&mut self, key: &ResponseKey, now: &Timestamp) -> Option<Vec<u8>> {
        self.purge_expired(now);
        self.entries.get(key).map(|e| e.frame.clone())
    }

    /// Stores the frame that answered `key`. An existing entry for the
    /// same key is kept (first response wins).
    pub fn insert(&mut self, key: ResponseKey, frame: Vec<u8>, now: Timestamp) {
        self.purge_expired(&now);
        if self.entries.contains_key(&key) {
            return;
        }
        while self.entries.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.entries.remove(&oldest);
                }
                None => break,
            }
        }
        self.order.push_back(key.clone());
        self.entries.insert(
            key,
            Entry {
                frame,
                inserted_at: now,
            },
        );
    }

    /// Drops entries older than the TTL.
    pub fn purge_expired(&mut self, now: &Timestamp) {
        while let Some(front) = self.order.front() {
            let expired = self
                .entries
                .get(front)
                .map(|e| now.exceeds(&e.inserted_at, self.ttl_secs))
                .unwrap_or(true);
            if !expired {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
            }
        }
    }

    /// Number of cached responses.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
