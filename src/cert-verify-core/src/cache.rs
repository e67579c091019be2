//! Verification result cache with TTL and bounded size.
//!
//! Entries are immutable once created and are replaced, never mutated. When
//! an insert would exceed the capacity, the cache sweeps out every expired
//! entry; if that frees nothing, it drops the first entry in key order.
//! There is no recency or frequency accounting.

use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, trace};

use crate::types::{RequestKey, VerifyOutcome};

/// A cached verification result.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// The cached outcome.
    outcome: VerifyOutcome,
    /// When the entry stops being served.
    expires_at: Instant,
}

impl CacheEntry {
    /// Create an entry that expires at `expires_at`.
    pub fn new(outcome: VerifyOutcome, expires_at: Instant) -> Self {
        Self {
            outcome,
            expires_at,
        }
    }

    /// Check if the entry is stale at `now`.
    pub fn has_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }

    /// The cached outcome.
    pub fn outcome(&self) -> &VerifyOutcome {
        &self.outcome
    }

    /// Expiry instant.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }
}

/// Bounded map from request key to verification result.
#[derive(Debug)]
pub struct VerificationCache {
    /// Entries in key order.
    entries: BTreeMap<RequestKey, CacheEntry>,
    /// Maximum number of entries.
    max_entries: usize,
}

impl VerificationCache {
    /// Create an empty cache holding at most `max_entries` results.
    pub fn new(max_entries: usize) -> Self {
        Self {
            entries: BTreeMap::new(),
            max_entries: max_entries.max(1),
        }
    }

    /// Look up a fresh result.
    ///
    /// An expired entry is removed and reported as a miss.
    pub fn get(&mut self, key: &RequestKey, now: Instant) -> Option<VerifyOutcome> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.has_expired(now) => return Some(entry.outcome.clone()),
            Some(_) => true,
            None => false,
        };

        if expired {
            trace!(hostname = %key.hostname(), "Cache: dropping expired entry");
            self.entries.remove(key);
        }
        None
    }

    /// Insert or replace a result, evicting first if the cache is full.
    pub fn insert(&mut self, key: RequestKey, entry: CacheEntry, now: Instant) {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.max_entries {
            self.evict(now);
        }
        self.entries.insert(key, entry);
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn remove_expired(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.has_expired(now));
        before - self.entries.len()
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Number of entries, fresh or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of entries.
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// Check if a key has an entry, fresh or not.
    pub fn contains(&self, key: &RequestKey) -> bool {
        self.entries.contains_key(key)
    }

    fn evict(&mut self, now: Instant) {
        let expired = self.remove_expired(now);
        if self.entries.len() < self.max_entries {
            debug!(expired, "Cache: evicted expired entries");
            return;
        }

        if let Some((key, _)) = self.entries.pop_first() {
            debug!(
                expired,
                hostname = %key.hostname(),
                "Cache: full, evicted first entry"
            );
        }
    }
}
