//! Pipeline Facade
//!
//! [`Pipeline`] wires the three mechanisms together into the two
//! function-shaped boundaries the rest of an application sees:
//!
//! - `batch_write(stream, record)` - fire-and-forget queueing into the
//!   micro-batcher; flush failures are absorbed by re-queue and never
//!   surface here.
//! - `cached_lookup(key)` / `lookup(key, ttl)` - cache read, and the
//!   read-through path that fills the cache from the backing store on miss.
//!
//! Each external dependency gets its own resilience guard: the bulk-insert
//! circuit and the backing-store-query circuit trip and recover
//! independently, so a failing warehouse does not block point lookups and
//! vice versa.
//!
//! ## Example
//!
//! ```ignore
//! use quotaflow_pipeline::Pipeline;
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::builder()
//!     .bulk_store(warehouse)
//!     .backing_store(lookup_store)
//!     .max_batch_records(500)
//!     .max_batch_age(Duration::from_secs(2))
//!     .build()
//!     .await?;
//!
//! pipeline.batch_write("payments", record);
//!
//! if let Some(row) = pipeline.lookup("dealer:D-1044:summary", Duration::from_secs(300)).await? {
//!     // served from cache on repeat calls within the TTL
//! }
//! ```

use crate::batcher::{Batcher, BatcherConfig};
use crate::cache::{CacheResult, TtlCache};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::connect::LazyStore;
use crate::error::{PipelineError, Result};
use crate::resilience::Resilience;
use crate::retry::RetryPolicy;
use quotaflow_core::{BackingStore, BulkStore, Row, StoreError};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{trace, warn};

/// Operational parameters for a pipeline instance.
///
/// Created by [`PipelineBuilder`]; every field has a sensible default.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Micro-batcher thresholds.
    pub batcher: BatcherConfig,
    /// Retry shape shared by both guarded categories.
    pub retry: RetryPolicy,
    /// Breaker sensitivity shared by both guarded categories (each category
    /// still gets its own breaker instance).
    pub circuit: CircuitBreakerConfig,
    /// Deadline applied to each individual store attempt.
    pub attempt_timeout: Duration,
    /// Period of the advisory expired-entry sweep; `None` disables it.
    pub cache_sweep_interval: Option<Duration>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batcher: BatcherConfig::default(),
            retry: RetryPolicy::default(),
            circuit: CircuitBreakerConfig::default(),
            attempt_timeout: Duration::from_secs(30),
            cache_sweep_interval: Some(Duration::from_secs(60)),
        }
    }
}

/// One independent pipeline: batcher + cache + resilience guards.
///
/// Owns all of its state explicitly - multiple pipelines can coexist in one
/// process and tear down independently.
pub struct Pipeline {
    batcher: Batcher,
    cache: Arc<TtlCache<Row>>,
    backing: LazyStore<dyn BackingStore>,
    lookup_guard: Resilience,
    cache_sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Pipeline {
    /// Create a [`PipelineBuilder`] with default configuration.
    pub fn builder() -> PipelineBuilder {
        PipelineBuilder::new()
    }

    /// Queue one record for bulk insertion. Fire-and-forget.
    ///
    /// Returns immediately, never performs I/O, and never surfaces eventual
    /// flush failures: a failed flush re-queues its records for the next
    /// attempt. Watch [`Pipeline::queue_depths`] for streams backing up
    /// behind an unhealthy store.
    pub fn batch_write(&self, stream: &str, record: quotaflow_core::Record) {
        self.batcher.put(stream, record);
    }

    /// Read the cache. Never performs I/O.
    ///
    /// A miss means the caller (or [`Pipeline::lookup`]) is responsible for
    /// computing a fresh value and writing it back through
    /// [`Pipeline::cache`].
    pub fn cached_lookup(&self, key: &str) -> CacheResult<Row> {
        self.cache.get(key)
    }

    /// Read-through lookup: cache hit, or backing-store query on miss.
    ///
    /// A row found in the backing store is cached under `ttl` before being
    /// returned; an absent row is returned but not cached. Store failures
    /// (after retries, or an open circuit) propagate to the caller - unlike
    /// batch writes, the caller asked for this value and needs to know.
    pub async fn lookup(&self, key: &str, ttl: Duration) -> Result<Option<Row>> {
        if let CacheResult::Hit { value, hit_count } = self.cache.get(key) {
            trace!(key, hit_count, "lookup served from cache");
            return Ok(Some(value));
        }

        let store = self.backing.get().await?;
        let row = self
            .lookup_guard
            .execute(|| {
                let store = Arc::clone(&store);
                async move { store.query(key).await }
            })
            .await?;

        if let Some(row) = &row {
            self.cache.put(key, row.clone(), ttl);
        }
        Ok(row)
    }

    /// The TTL cache, for external fills and metrics.
    pub fn cache(&self) -> &TtlCache<Row> {
        &self.cache
    }

    /// The micro-batcher, for explicit flushes and introspection.
    pub fn batcher(&self) -> &Batcher {
        &self.batcher
    }

    /// Queue depths for all known streams (monitoring hook).
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.batcher.queue_depths()
    }

    /// Graceful shutdown: stop background tasks, then flush every stream.
    ///
    /// Flush failures are logged; whatever could not be delivered is lost
    /// with the process, which is the accepted crash behavior.
    pub async fn close(self) {
        if let Some(handle) = self.cache_sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.batcher.stop_sweeper();
        self.batcher.flush_all().await;
    }
}

/// Builder for configuring and creating a [`Pipeline`].
///
/// Both stores are required; they can be supplied ready-made or as connect
/// factories that run lazily on first use (with the outcome cached either
/// way).
pub struct PipelineBuilder {
    config: PipelineConfig,
    bulk_store: Option<LazyStore<dyn BulkStore>>,
    backing_store: Option<LazyStore<dyn BackingStore>>,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineBuilder {
    /// Create a builder with default configuration and no stores.
    pub fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            bulk_store: None,
            backing_store: None,
        }
    }

    /// Use an already-constructed bulk store.
    pub fn bulk_store(mut self, store: Arc<dyn BulkStore>) -> Self {
        self.bulk_store = Some(LazyStore::ready(store));
        self
    }

    /// Connect the bulk store lazily on first flush.
    pub fn bulk_store_with<F, Fut>(mut self, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Arc<dyn BulkStore>, StoreError>> + Send + 'static,
    {
        self.bulk_store = Some(LazyStore::connect_with(connect));
        self
    }

    /// Use an already-constructed backing store.
    pub fn backing_store(mut self, store: Arc<dyn BackingStore>) -> Self {
        self.backing_store = Some(LazyStore::ready(store));
        self
    }

    /// Connect the backing store lazily on first lookup miss.
    pub fn backing_store_with<F, Fut>(mut self, connect: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<Arc<dyn BackingStore>, StoreError>> + Send + 'static,
    {
        self.backing_store = Some(LazyStore::connect_with(connect));
        self
    }

    /// Queue length that triggers an immediate flush (default: 100).
    pub fn max_batch_records(mut self, records: usize) -> Self {
        self.config.batcher.max_batch_records = records;
        self
    }

    /// Upper bound on flush latency for low-traffic streams (default: 5s).
    pub fn max_batch_age(mut self, age: Duration) -> Self {
        self.config.batcher.max_batch_age = age;
        self
    }

    /// Cap on a single bulk-store call (default: 500).
    pub fn max_records_per_call(mut self, records: usize) -> Self {
        self.config.batcher.max_records_per_call = records;
        self
    }

    /// Retry shape for guarded store calls.
    pub fn retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.config.retry = retry;
        self
    }

    /// Breaker trip/recovery sensitivity.
    pub fn circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.config.circuit = circuit;
        self
    }

    /// Per-attempt deadline on guarded store calls (default: 30s).
    pub fn attempt_timeout(mut self, timeout: Duration) -> Self {
        self.config.attempt_timeout = timeout;
        self
    }

    /// Period of the advisory cache sweep; `None` disables it
    /// (default: 60s).
    pub fn cache_sweep_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.cache_sweep_interval = interval;
        self
    }

    /// Assemble the pipeline and start its background tasks.
    ///
    /// # Errors
    ///
    /// `PipelineError::Config` if either store is missing. Store
    /// connections are not attempted here - that happens lazily on first
    /// use.
    pub async fn build(self) -> Result<Pipeline> {
        let bulk_store = self
            .bulk_store
            .ok_or_else(|| PipelineError::Config("bulk store not configured".to_string()))?;
        let backing_store = self
            .backing_store
            .ok_or_else(|| PipelineError::Config("backing store not configured".to_string()))?;

        let config = self.config;

        let batcher = Batcher::new(
            bulk_store,
            Resilience::new(
                "bulk-insert",
                config.retry.clone(),
                config.circuit.clone(),
                config.attempt_timeout,
            ),
            config.batcher.clone(),
        );
        batcher.start_sweeper();

        let lookup_guard = Resilience::new(
            "backing-store-query",
            config.retry.clone(),
            config.circuit.clone(),
            config.attempt_timeout,
        );

        let cache = Arc::new(TtlCache::new());
        let cache_sweeper = config.cache_sweep_interval.map(|period| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let removed = cache.sweep();
                    if removed > 0 {
                        trace!(removed, "cache sweep reclaimed expired entries");
                    }
                }
            })
        });

        if config.batcher.max_batch_records == 0 {
            warn!("max_batch_records is 0; every put will trigger a flush");
        }

        Ok(Pipeline {
            batcher,
            cache,
            backing: backing_store,
            lookup_guard,
            cache_sweeper: Mutex::new(cache_sweeper),
        })
    }
}
