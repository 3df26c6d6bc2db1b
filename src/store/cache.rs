//! Bounded vector cache: true LRU by last access, plus optional per-entry TTL.
//!
//! Whichever fires first wins: an entry leaves when it is the least recently
//! accessed one at capacity, or once its TTL expired (on access, on purge, or
//! when an insert needs its slot).
//! A single mutex guards the map, so concurrent writes to the same key are
//! linearizable.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use lru::LruCache;
use serde::{Deserialize, Serialize};

use super::backend::SimilarityMatch;
use crate::fingerprint::Fingerprint;

/// What is remembered about a fingerprint besides its vector
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Matches the backend returned for this content
    pub matches: Vec<SimilarityMatch>,
    /// Backend that produced them
    pub source: String,
}

/// One cached fingerprint
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    /// Key
    pub fingerprint: Fingerprint,
    /// Query vector
    pub vector: Vec<f32>,
    /// Metadata
    pub metadata: EntryMetadata,
    /// Insert time
    pub inserted_at: Instant,
    /// Last successful lookup (or insert)
    pub last_access: Instant,
    /// Per-entry TTL
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.ttl
            .is_some_and(|ttl| now.saturating_duration_since(self.inserted_at) >= ttl)
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup {
    /// Live entry
    Hit(CacheEntry),
    /// Absent or expired
    Miss,
}

impl Lookup {
    /// True on hit
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    /// Entry, if hit
    pub fn entry(self) -> Option<CacheEntry> {
        match self {
            Lookup::Hit(entry) => Some(entry),
            Lookup::Miss => None,
        }
    }
}

/// LRU + TTL cache keyed by fingerprint
#[derive(Debug)]
pub struct VectorCache {
    entries: Mutex<LruCache<Fingerprint, CacheEntry>>,
    default_ttl: Option<Duration>,
    evictions: AtomicU64,
    expirations: AtomicU64,
}

impl VectorCache {
    /// Create a cache holding at most `capacity` entries
    pub fn new(capacity: usize, default_ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl,
            evictions: AtomicU64::new(0),
            expirations: AtomicU64::new(0),
        }
    }

    fn entries(&self) -> MutexGuard<'_, LruCache<Fingerprint, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a fingerprint, refreshing its recency on hit
    pub fn get(&self, fingerprint: &Fingerprint) -> Lookup {
        self.get_at(fingerprint, Instant::now())
    }

    fn get_at(&self, fingerprint: &Fingerprint, now: Instant) -> Lookup {
        let mut entries = self.entries();
        match entries.get_mut(fingerprint) {
            None => return Lookup::Miss,
            Some(entry) if !entry.is_expired(now) => {
                entry.last_access = now;
                return Lookup::Hit(entry.clone());
            },
            Some(_) => {},
        }
        entries.pop(fingerprint);
        self.expirations.fetch_add(1, Ordering::Relaxed);
        Lookup::Miss
    }

    /// Insert with the default TTL
    pub fn insert(&self, fingerprint: Fingerprint, vector: Vec<f32>, metadata: EntryMetadata) {
        self.insert_with_ttl(fingerprint, vector, metadata, self.default_ttl);
    }

    /// Insert (or replace) with an explicit TTL
    pub fn insert_with_ttl(
        &self,
        fingerprint: Fingerprint,
        vector: Vec<f32>,
        metadata: EntryMetadata,
        ttl: Option<Duration>,
    ) {
        self.insert_at(fingerprint, vector, metadata, ttl, Instant::now());
    }

    fn insert_at(
        &self,
        fingerprint: Fingerprint,
        vector: Vec<f32>,
        metadata: EntryMetadata,
        ttl: Option<Duration>,
        now: Instant,
    ) {
        let entry = CacheEntry {
            fingerprint,
            vector,
            metadata,
            inserted_at: now,
            last_access: now,
            ttl,
        };

        let mut entries = self.entries();
        // expired entries give up their slot before a live one is evicted
        if !entries.contains(&fingerprint) && entries.len() >= entries.cap().get() {
            let expired = Self::drop_expired(&mut entries, now);
            self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
        }

        let evicted = entries.push(fingerprint, entry);
        // push returns the replaced entry for an existing key; only a different key is an eviction
        if let Some((key, _)) = evicted {
            if key != fingerprint {
                self.evictions.fetch_add(1, Ordering::Relaxed);
                tracing::trace!(fingerprint = %key.short(), "evicted least recently used entry");
            }
        }
    }

    fn drop_expired(entries: &mut LruCache<Fingerprint, CacheEntry>, now: Instant) -> usize {
        let expired: Vec<Fingerprint> = entries
            .iter()
            .filter(|(_, e)| e.is_expired(now))
            .map(|(k, _)| *k)
            .collect();
        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Remove an entry
    pub fn remove(&self, fingerprint: &Fingerprint) -> Option<CacheEntry> {
        self.entries().pop(fingerprint)
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    fn purge_expired_at(&self, now: Instant) -> usize {
        let expired = Self::drop_expired(&mut self.entries(), now);
        self.expirations.fetch_add(expired as u64, Ordering::Relaxed);
        expired
    }

    /// Live entry count (expired entries not yet purged included)
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// True when empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity
    pub fn capacity(&self) -> usize {
        self.entries().cap().get()
    }

    /// Drop everything
    pub fn clear(&self) {
        self.entries().clear();
    }

    /// Capacity evictions so far
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// TTL expirations so far
    pub fn expirations(&self) -> u64 {
        self.expirations.load(Ordering::Relaxed)
    }
}
