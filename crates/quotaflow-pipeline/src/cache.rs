//! TTL Cache for Backing-Store Lookups
//!
//! This module memoizes expensive point lookups for a bounded freshness
//! window so a metered backing store is not asked the same question twice in
//! quick succession.
//!
//! ## What Gets Cached
//!
//! Whatever the caller puts in: the cache is a pure store. It never knows how
//! to compute a value - on a miss the caller (typically the pipeline's
//! read-through path) fetches a fresh value and writes it back with a TTL of
//! its own choosing, so different data classes carry different freshness
//! requirements.
//!
//! ## Expiry Enforcement
//!
//! The load-bearing invariant: a `get` after an entry's expiry behaves
//! identically to a `get` on a key that was never written, whether or not the
//! entry has been physically removed. The sweep ([`TtlCache::sweep`]) only
//! reclaims memory; correctness comes from the expiry check on every read.
//!
//! ## Keys
//!
//! Keys are composed deterministically from semantic parts with
//! [`cache_key`], so two logically identical requests always produce
//! byte-identical keys:
//!
//! ```text
//! cache_key("dealer", "D-1044", "summary") → "dealer:D-1044:summary"
//! ```

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::time::{Duration, Instant};
use tracing::{debug, trace};

/// Separator used by [`cache_key`].
pub const KEY_SEPARATOR: char = ':';

/// Compose a cache key from its semantic parts.
///
/// Deterministic: the same (kind, subject, context) triple always yields the
/// same key, independent of when or where it is built.
pub fn cache_key(kind: &str, subject: &str, context: &str) -> String {
    format!("{kind}{KEY_SEPARATOR}{subject}{KEY_SEPARATOR}{context}")
}

/// A cached value with expiry and access bookkeeping.
#[derive(Debug, Clone)]
struct CacheEntry<T> {
    value: T,
    /// Absolute expiry; the entry is logically absent from this instant on.
    expires_at: Instant,
    created_at: Instant,
    last_accessed: Instant,
    /// Successful reads served from this entry.
    hits: u64,
}

impl<T> CacheEntry<T> {
    fn new(value: T, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            expires_at: now + ttl,
            created_at: now,
            last_accessed: now,
            hits: 0,
        }
    }

    fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }
}

/// Outcome of a cache read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheResult<T> {
    /// An unexpired entry was found.
    Hit {
        value: T,
        /// Reads served from this entry so far, this one included.
        hit_count: u64,
    },
    /// No entry, or the entry had expired. The caller computes a fresh value
    /// and `put`s it back.
    Miss,
}

/// Point-in-time bookkeeping for one cache entry (monitoring hook).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    /// Reads served from this entry.
    pub hits: u64,
    /// Time since the entry was written.
    pub age: Duration,
    /// Time since the entry was last read (equals `age` if never read).
    pub idle: Duration,
    /// Time until expiry; `None` once expired but not yet swept.
    pub expires_in: Option<Duration>,
}

impl<T> CacheResult<T> {
    /// True for `Hit`.
    pub fn is_hit(&self) -> bool {
        matches!(self, CacheResult::Hit { .. })
    }

    /// The hit value, discarding bookkeeping.
    pub fn into_value(self) -> Option<T> {
        match self {
            CacheResult::Hit { value, .. } => Some(value),
            CacheResult::Miss => None,
        }
    }
}

/// Cache performance counters.
#[derive(Debug, Default)]
pub struct CacheMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CacheMetrics {
    /// Total reads served from cache.
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Total reads that fell through to the caller.
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Hit rate in [0.0, 1.0]; 0.0 when no reads have happened.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits() as f64;
        let total = hits + self.misses() as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Reset both counters.
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }
}

/// In-memory cache with per-entry TTL and hit bookkeeping.
///
/// State lives in a sharded concurrent map, so reads and writes of unrelated
/// keys never contend on a common lock. No path performs I/O.
pub struct TtlCache<T: Clone> {
    entries: DashMap<String, CacheEntry<T>>,
    metrics: CacheMetrics,
}

impl<T: Clone> Default for TtlCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> TtlCache<T> {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            metrics: CacheMetrics::default(),
        }
    }

    /// Read a value.
    ///
    /// An unexpired entry has its hit counter and last-accessed time updated
    /// and its value returned. An expired entry is removed and reported as a
    /// miss - indistinguishable from a key never written.
    pub fn get(&self, key: &str) -> CacheResult<T> {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if !entry.is_expired() {
                entry.hits += 1;
                entry.last_accessed = Instant::now();
                self.metrics.hits.fetch_add(1, Ordering::Relaxed);
                trace!(key, hits = entry.hits, "cache hit");
                return CacheResult::Hit {
                    value: entry.value.clone(),
                    hit_count: entry.hits,
                };
            }
            drop(entry);
            // Reclaim eagerly, but only if still expired: a concurrent put
            // may have replaced the entry with a fresh one.
            self.entries.remove_if(key, |_, entry| entry.is_expired());
        }

        self.metrics.misses.fetch_add(1, Ordering::Relaxed);
        trace!(key, "cache miss");
        CacheResult::Miss
    }

    /// Write a value with its freshness window.
    ///
    /// Unconditionally overwrites any existing entry; expiry is `now + ttl`,
    /// computed here at write time.
    pub fn put(&self, key: impl Into<String>, value: T, ttl: Duration) {
        let key = key.into();
        trace!(key = %key, ttl_ms = ttl.as_millis() as u64, "cache put");
        self.entries.insert(key, CacheEntry::new(value, ttl));
    }

    /// Remove one entry, returning whether it existed (expired or not).
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Physically remove expired entries, returning how many were reclaimed.
    ///
    /// Purely advisory: `get` already treats expired entries as absent. This
    /// just keeps memory bounded between natural overwrites.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired());
        let removed = before - self.entries.len();
        if removed > 0 {
            debug!(removed, remaining = self.entries.len(), "swept expired cache entries");
        }
        removed
    }

    /// Number of physically present entries (expired ones included until
    /// swept).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no entries are physically present.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Performance counters for this cache.
    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    /// Bookkeeping for one physically present entry, expired or not.
    pub fn entry_info(&self, key: &str) -> Option<EntryInfo> {
        self.entries.get(key).map(|entry| {
            let now = Instant::now();
            EntryInfo {
                hits: entry.hits,
                age: now.duration_since(entry.created_at),
                idle: now.duration_since(entry.last_accessed),
                expires_in: entry.expires_at.checked_duration_since(now),
            }
        })
    }
}
