//! Threat vector store.
//!
//! A bounded LRU/TTL cache of fingerprint -> (vector, known-threat matches),
//! fronting a pluggable similarity-search backend.
//!
//! # Lookup flow
//!
//! ```text
//! lookup_or_query(content)
//!     │
//!     ├── cache hit ───────────────────────────────> Cached(matches)
//!     │
//!     └── miss ──> query already in flight for fp? ──yes──> wait on it (coalesced)
//!                        │ no
//!                        v
//!                  embed + backend query (timeout)
//!                        │
//!                        ├── ok ──> insert into cache ──> Queried(matches)
//!                        └── err ──> error counted ──────> Degraded
//! ```
//!
//! Only one external query per fingerprint is outstanding at a time. A failed
//! query never surfaces as an error from `lookup_or_query`; the caller keeps
//! its static-rule verdict.

mod backend;
mod cache;
mod embed;
mod process;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::{Deserialize, Serialize};

pub use backend::{
    rank, BackendFuture, CorpusEntry, InMemoryBackend, NullBackend, SimilarityBackend, SimilarityMatch,
    SimilarityQuery, MAX_DIMS, MAX_K,
};
pub use cache::{CacheEntry, EntryMetadata, Lookup, VectorCache};
pub use embed::{cosine_similarity, Embedder, HashingEmbedder};
pub use process::ProcessBackend;

use crate::config::{BackendConfig, StoreConfig};
use crate::error::{Result, WardenError};
use crate::fingerprint::Fingerprint;

type SharedQuery = Shared<BoxFuture<'static, Option<Vec<SimilarityMatch>>>>;

/// Outcome of a cache-first similarity lookup
#[derive(Debug, Clone, PartialEq)]
pub enum VectorOutcome {
    /// Served from the cache
    Cached(Vec<SimilarityMatch>),
    /// Fresh backend answer (possibly shared with concurrent callers)
    Queried(Vec<SimilarityMatch>),
    /// Backend failed; treat as a miss
    Degraded,
}

impl VectorOutcome {
    /// Matches, empty when degraded
    pub fn matches(&self) -> &[SimilarityMatch] {
        match self {
            VectorOutcome::Cached(m) | VectorOutcome::Queried(m) => m,
            VectorOutcome::Degraded => &[],
        }
    }

    /// True when the backend failed
    pub fn is_degraded(&self) -> bool {
        matches!(self, VectorOutcome::Degraded)
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Cache hits
    pub hits: u64,
    /// Cache misses
    pub misses: u64,
    /// hits / (hits + misses)
    pub hit_rate: f64,
    /// Backend queries issued
    pub external_queries: u64,
    /// Backend failures (timeout, crash, malformed output)
    pub external_errors: u64,
    /// Callers that joined an in-flight query
    pub coalesced: u64,
    /// LRU evictions
    pub evictions: u64,
    /// TTL expirations
    pub expirations: u64,
    /// Mean backend latency
    pub avg_external_latency_ms: f64,
    /// Cached entries
    pub entries: usize,
    /// Cache capacity
    pub capacity: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    external_queries: AtomicU64,
    external_errors: AtomicU64,
    coalesced: AtomicU64,
    external_latency_us: AtomicU64,
}

struct StoreInner {
    cache: VectorCache,
    backend: Arc<dyn SimilarityBackend>,
    embedder: Arc<dyn Embedder>,
    config: StoreConfig,
    in_flight: Mutex<HashMap<Fingerprint, SharedQuery>>,
    counters: Counters,
}

/// Cache + coalesced similarity search
#[derive(Clone)]
pub struct ThreatVectorStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for ThreatVectorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreatVectorStore")
            .field("backend", &self.inner.backend.name())
            .field("entries", &self.inner.cache.len())
            .finish()
    }
}

impl ThreatVectorStore {
    /// Assemble a store from parts
    pub fn new(config: StoreConfig, backend: Arc<dyn SimilarityBackend>, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                cache: VectorCache::new(config.capacity, config.ttl()),
                backend,
                embedder,
                config,
                in_flight: Mutex::new(HashMap::new()),
                counters: Counters::default(),
            }),
        }
    }

    /// Build embedder and backend from configuration
    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::new(config.embedding_dims));
        let backend: Arc<dyn SimilarityBackend> = match &config.backend {
            BackendConfig::None => Arc::new(NullBackend),
            BackendConfig::Memory { corpus_path: None } => {
                Arc::new(InMemoryBackend::with_builtin_corpus(Arc::clone(&embedder)))
            },
            BackendConfig::Memory {
                corpus_path: Some(path),
            } => Arc::new(InMemoryBackend::from_jsonl(path, Arc::clone(&embedder))?),
            BackendConfig::Process {
                program,
                args,
                collection,
                pass_text,
                max_text_bytes,
            } => {
                let mut backend = ProcessBackend::new(program.clone())
                    .with_args(args.iter().cloned())
                    .with_timeout(config.query_timeout());
                if let Some(collection) = collection {
                    backend = backend.with_collection(collection.clone());
                }
                if *pass_text {
                    backend = backend.with_text(*max_text_bytes);
                }
                Arc::new(backend)
            },
        };
        tracing::debug!(backend = backend.name(), capacity = config.capacity, "threat vector store ready");
        Ok(Self::new(config.clone(), backend, embedder))
    }

    /// Backend name
    pub fn backend_name(&self) -> &str {
        self.inner.backend.name()
    }

    /// The cache
    pub fn cache(&self) -> &VectorCache {
        &self.inner.cache
    }

    /// Embed content with the configured embedder
    pub fn embed(&self, content: &[u8]) -> Vec<f32> {
        self.inner.embedder.embed(content)
    }

    /// Cache lookup (counted as hit or miss)
    pub fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        self.inner.lookup(fingerprint)
    }

    /// Cache insert
    pub fn store(&self, fingerprint: Fingerprint, vector: Vec<f32>, metadata: EntryMetadata) {
        self.inner.cache.insert(fingerprint, vector, metadata);
    }

    /// Uncached, uncoalesced backend query with the configured timeout
    pub async fn query_external(&self, query: &SimilarityQuery) -> Result<Vec<SimilarityMatch>> {
        self.inner.query_external(query).await
    }

    /// Cache first, then a coalesced backend query; failures degrade
    pub async fn lookup_or_query(&self, content: &[u8]) -> VectorOutcome {
        let fingerprint = Fingerprint::of(content);

        if let Lookup::Hit(entry) = self.inner.lookup(&fingerprint) {
            return VectorOutcome::Cached(entry.metadata.matches);
        }

        let pending = match self.inner.join_in_flight(&fingerprint) {
            Some(existing) => existing,
            None => {
                // embedding is the expensive part; keep it outside the lock
                let query = self.inner.build_query(fingerprint, content);
                let mut in_flight = self.inner.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(existing) = in_flight.get(&fingerprint) {
                    self.inner.counters.coalesced.fetch_add(1, Ordering::Relaxed);
                    existing.clone()
                } else {
                    let pending = spawn_query(Arc::clone(&self.inner), query);
                    in_flight.insert(fingerprint, pending.clone());
                    pending
                }
            },
        };

        match pending.await {
            Some(matches) => VectorOutcome::Queried(matches),
            None => VectorOutcome::Degraded,
        }
    }

    /// Drop expired cache entries
    pub fn purge_expired(&self) -> usize {
        self.inner.cache.purge_expired()
    }

    /// Queries currently outstanding
    pub fn in_flight(&self) -> usize {
        self.inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> StoreStats {
        let c = &self.inner.counters;
        let hits = c.hits.load(Ordering::Relaxed);
        let misses = c.misses.load(Ordering::Relaxed);
        let external_queries = c.external_queries.load(Ordering::Relaxed);
        let latency_us = c.external_latency_us.load(Ordering::Relaxed);

        StoreStats {
            hits,
            misses,
            hit_rate: if hits + misses > 0 {
                hits as f64 / (hits + misses) as f64
            } else {
                0.0
            },
            external_queries,
            external_errors: c.external_errors.load(Ordering::Relaxed),
            coalesced: c.coalesced.load(Ordering::Relaxed),
            evictions: self.inner.cache.evictions(),
            expirations: self.inner.cache.expirations(),
            avg_external_latency_ms: if external_queries > 0 {
                latency_us as f64 / external_queries as f64 / 1000.0
            } else {
                0.0
            },
            entries: self.inner.cache.len(),
            capacity: self.inner.cache.capacity(),
        }
    }
}

impl StoreInner {
    fn lookup(&self, fingerprint: &Fingerprint) -> Lookup {
        let result = self.cache.get(fingerprint);
        let counter = if result.is_hit() {
            &self.counters.hits
        } else {
            &self.counters.misses
        };
        counter.fetch_add(1, Ordering::Relaxed);
        result
    }

    fn join_in_flight(&self, fingerprint: &Fingerprint) -> Option<SharedQuery> {
        let in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        let existing = in_flight.get(fingerprint)?.clone();
        self.counters.coalesced.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(fingerprint = %fingerprint.short(), "joined in-flight similarity query");
        Some(existing)
    }

    fn build_query(&self, fingerprint: Fingerprint, content: &[u8]) -> SimilarityQuery {
        let query = SimilarityQuery::new(
            fingerprint,
            self.embedder.embed(content),
            self.config.top_k,
            self.config.similarity_threshold,
        );
        match std::str::from_utf8(content) {
            Ok(text) => query.with_text(text),
            Err(_) => query,
        }
    }

    async fn query_external(&self, query: &SimilarityQuery) -> Result<Vec<SimilarityMatch>> {
        let start = Instant::now();
        self.counters.external_queries.fetch_add(1, Ordering::Relaxed);

        let timeout = self.config.query_timeout();
        let result = match query.validate() {
            Err(e) => Err(e),
            Ok(()) => tokio::time::timeout(timeout, self.backend.query(query))
                .await
                .unwrap_or_else(|_| {
                    Err(WardenError::ExternalQuery(format!(
                        "{} backend timed out after {}ms",
                        self.backend.name(),
                        timeout.as_millis()
                    )))
                }),
        };

        let elapsed_us = u64::try_from(start.elapsed().as_micros()).unwrap_or(u64::MAX);
        self.counters
            .external_latency_us
            .fetch_add(elapsed_us, Ordering::Relaxed);

        if let Err(e) = &result {
            self.counters.external_errors.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                fingerprint = %query.fingerprint.short(),
                backend = self.backend.name(),
                "similarity query failed, degrading to miss: {e}"
            );
        }
        result
    }
}

/// Run the query on its own task so it completes (and is cached) even if the
/// caller that started it goes away.
fn spawn_query(inner: Arc<StoreInner>, query: SimilarityQuery) -> SharedQuery {
    let handle = tokio::spawn(async move {
        let fingerprint = query.fingerprint;
        let outcome = match inner.query_external(&query).await {
            Ok(matches) => {
                let metadata = EntryMetadata {
                    matches: matches.clone(),
                    source: inner.backend.name().to_string(),
                };
                inner.cache.insert(fingerprint, query.vector, metadata);
                Some(matches)
            },
            Err(_) => None,
        };
        inner
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&fingerprint);
        outcome
    });

    handle
        .map(|joined| match joined {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!("similarity query task failed: {e}");
                None
            },
        })
        .boxed()
        .shared()
}
