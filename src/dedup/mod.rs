//! In-memory record of entries already scheduled for delivery.
//!
//! This is a cache in front of the persistence store: losing it (restart,
//! eviction, `clear`) may cause a duplicate *attempt*, never a duplicate
//! delivery, because the store is consulted before anything is recorded.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::domain::DedupKey;

/// Prune expired keys once the map grows past this many entries
const PRUNE_THRESHOLD: usize = 4096;

/// Longest a key is remembered, whatever TTL the caller asks for
const MAX_TTL: Duration = Duration::from_secs(10 * 365 * 24 * 3600);

#[cfg_attr(test, mockall::automock)]
pub trait DedupStore: Send + Sync {
    /// True if the key has not been seen or its TTL has lapsed
    fn is_new(&self, key: &DedupKey) -> bool;

    /// Record the key as seen for `ttl`
    fn mark_seen(&self, key: &DedupKey, ttl: Duration);

    /// Atomically mark the key and report whether it was new
    fn check_and_mark(&self, key: &DedupKey, ttl: Duration) -> bool;

    /// Forget every key
    fn clear(&self);

    fn len(&self) -> usize;
}

/// Mutex-guarded map from key to expiry instant.
///
/// Uses tokio's clock so paused-time tests control expiry.
#[derive(Debug, Default)]
pub struct MemoryDedupStore {
    keys: Mutex<HashMap<String, Instant>>,
}

impl MemoryDedupStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_keys<T>(&self, f: impl FnOnce(&mut HashMap<String, Instant>) -> T) -> T {
        // A poisoned lock only means another worker panicked mid-insert;
        // the map itself is still usable.
        let mut keys = match self.keys.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut keys)
    }

    fn expiry(now: Instant, ttl: Duration) -> Instant {
        now.checked_add(ttl.min(MAX_TTL)).unwrap_or(now)
    }

    fn prune(keys: &mut HashMap<String, Instant>, now: Instant) {
        if keys.len() >= PRUNE_THRESHOLD {
            keys.retain(|_, expires| *expires > now);
        }
    }
}

impl DedupStore for MemoryDedupStore {
    fn is_new(&self, key: &DedupKey) -> bool {
        let now = Instant::now();
        self.with_keys(|keys| match keys.get(key.as_str()) {
            Some(expires) => *expires <= now,
            None => true,
        })
    }

    fn mark_seen(&self, key: &DedupKey, ttl: Duration) {
        let now = Instant::now();
        self.with_keys(|keys| {
            Self::prune(keys, now);
            keys.insert(key.as_str().to_string(), Self::expiry(now, ttl));
        });
    }

    fn check_and_mark(&self, key: &DedupKey, ttl: Duration) -> bool {
        let now = Instant::now();
        self.with_keys(|keys| {
            Self::prune(keys, now);
            let is_new = keys.get(key.as_str()).map_or(true, |expires| *expires <= now);
            if is_new {
                keys.insert(key.as_str().to_string(), Self::expiry(now, ttl));
            }
            is_new
        })
    }

    fn clear(&self) {
        self.with_keys(|keys| keys.clear());
    }

    fn len(&self) -> usize {
        self.with_keys(|keys| keys.len())
    }
}
