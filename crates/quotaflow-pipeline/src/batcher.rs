//! Micro-Batching for Bulk Store Writes
//!
//! This module decouples producers of individual records from the cost of
//! one bulk-insert call per record. Records accumulate in per-stream queues
//! and are flushed when a size or age threshold is met.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐
//! │  put(stream, r)  │ fire-and-forget, never does I/O
//! └──────┬───────────┘
//!        │
//!        ▼
//! ┌────────────────────────────────────┐
//! │  StreamQueue (one per stream)      │
//! │  - records: Vec<Record>            │
//! │  - oldest_pending: Option<Instant> │
//! └──────┬─────────────────────────────┘
//!        │
//!        ├─→ Flush when len >= max_batch_records (spawned immediately)
//!        ├─→ Flush when oldest record older than max_batch_age (sweeper)
//!        ├─→ Flush on explicit flush()/flush_all() call
//!        │
//!        ▼
//! ┌────────────────────────────────────┐
//! │  BulkStore::insert_batch           │ through the resilience guard,
//! │  (chunks of max_records_per_call)  │ sequential, order-preserving
//! └────────────────────────────────────┘
//! ```
//!
//! ## Failure Handling
//!
//! A flush that fails after retries (or behind an open circuit) splices every
//! unsent record back onto the **front** of the live queue, ahead of records
//! that arrived during the attempt, and keeps the stream's oldest-pending
//! timestamp. Nothing is dropped and producers never see the failure:
//! delivery is at-least-once, bounded only by memory. Use
//! [`Batcher::queue_depths`] to watch for streams accumulating behind an
//! unhealthy store.

use crate::connect::LazyStore;
use crate::error::Result;
use crate::resilience::Resilience;
use dashmap::DashMap;
use quotaflow_core::{BulkStore, Record};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, Instant};
use tracing::{debug, trace, warn};

/// Configuration for the micro-batcher.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatcherConfig {
    /// Queue length that triggers an immediate flush of a stream.
    pub max_batch_records: usize,

    /// Upper bound on how long a record may sit unflushed; the sweeper
    /// flushes any stream whose oldest record exceeds this, regardless of
    /// queue length.
    pub max_batch_age: Duration,

    /// Upper bound on a single bulk-store call; a larger queue is split into
    /// sequential calls of at most this many records.
    pub max_records_per_call: usize,
}

impl Default for BatcherConfig {
    fn default() -> Self {
        Self {
            max_batch_records: 100,
            max_batch_age: Duration::from_secs(5),
            max_records_per_call: 500,
        }
    }
}

/// Pending records for a single stream.
///
/// Lives inside the batcher's concurrent map; the map's shard lock protects
/// the queue itself, while `flush_gate` serializes whole flush operations so
/// a requeued failed batch can never be reordered behind a later flush.
#[derive(Default)]
struct StreamQueue {
    /// Records waiting to be flushed, in append order.
    records: Vec<Record>,
    /// When the oldest unflushed record was appended.
    oldest_pending: Option<Instant>,
    /// Held for the duration of a flush attempt.
    flush_gate: Arc<tokio::sync::Mutex<()>>,
}

/// Accumulates records per stream and flushes them in bulk.
///
/// Cheap to clone; clones share the same queues, store handle, and circuit
/// breaker.
#[derive(Clone)]
pub struct Batcher {
    inner: Arc<BatcherInner>,
}

struct BatcherInner {
    /// Per-stream queues, keyed by stream name.
    streams: DashMap<String, StreamQueue>,
    /// Bulk store, connected on first flush.
    store: LazyStore<dyn BulkStore>,
    /// Retry + circuit breaker for the bulk-insert category.
    guard: Resilience,
    config: BatcherConfig,
    /// Handle to the periodic age sweeper, if started.
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Batcher {
    /// Create a batcher over a bulk store.
    ///
    /// The store may be lazy; a failed connection fails flushes (which
    /// requeue) without ever surfacing to `put` callers.
    pub fn new(store: LazyStore<dyn BulkStore>, guard: Resilience, config: BatcherConfig) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                streams: DashMap::new(),
                store,
                guard,
                config,
                sweeper: Mutex::new(None),
            }),
        }
    }

    /// Queue one record for the named stream. Fire-and-forget.
    ///
    /// Appends under the stream's shard lock and returns immediately; never
    /// performs I/O. If the queue reaches `max_batch_records` the flush is
    /// scheduled on a background task, not awaited here.
    pub fn put(&self, stream: &str, record: Record) {
        let should_flush = {
            let mut queue = self.inner.streams.entry(stream.to_string()).or_default();
            if queue.records.is_empty() {
                queue.oldest_pending = Some(Instant::now());
            }
            queue.records.push(record);
            trace!(
                stream,
                pending = queue.records.len(),
                "queued record for bulk insert"
            );
            queue.records.len() >= self.inner.config.max_batch_records
        };

        if should_flush {
            let inner = Arc::clone(&self.inner);
            let stream = stream.to_string();
            tokio::spawn(async move {
                if let Err(err) = inner.flush_stream(&stream).await {
                    // Records are already requeued; the sweeper will retry.
                    warn!(stream = %stream, error = %err, "size-triggered flush failed");
                }
            });
        }
    }

    /// Flush one stream now and wait for the outcome.
    ///
    /// Used by the shutdown path and by tests; the steady-state triggers are
    /// the size threshold and the age sweeper. On failure the batch has
    /// already been restored to the queue.
    pub async fn flush(&self, stream: &str) -> Result<()> {
        self.inner.flush_stream(stream).await
    }

    /// Flush every stream regardless of thresholds (graceful shutdown).
    ///
    /// Failures are logged and the remaining streams are still flushed.
    pub async fn flush_all(&self) {
        let streams: Vec<String> = self
            .inner
            .streams
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        for stream in streams {
            if let Err(err) = self.inner.flush_stream(&stream).await {
                warn!(stream = %stream, error = %err, "failed to flush stream on shutdown");
            }
        }
    }

    /// Start the periodic age sweeper.
    ///
    /// Every `max_batch_age / 2` the sweeper flushes streams whose oldest
    /// pending record has exceeded `max_batch_age`, bounding put-to-store
    /// latency for low-traffic streams. Restarting replaces a running
    /// sweeper.
    pub fn start_sweeper(&self) {
        let period = (self.inner.config.max_batch_age / 2).max(Duration::from_millis(1));
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            loop {
                ticker.tick().await;
                inner.flush_aged().await;
            }
        });

        if let Some(previous) = self.inner.sweeper.lock().unwrap().replace(handle) {
            previous.abort();
        }
    }

    /// Stop the age sweeper, if running.
    pub fn stop_sweeper(&self) {
        if let Some(handle) = self.inner.sweeper.lock().unwrap().take() {
            handle.abort();
        }
    }

    /// Number of records currently queued for one stream.
    ///
    /// The monitoring hook for streams accumulating behind an open circuit.
    pub fn queue_depth(&self, stream: &str) -> usize {
        self.inner
            .streams
            .get(stream)
            .map_or(0, |queue| queue.records.len())
    }

    /// Queue depths for all known streams.
    pub fn queue_depths(&self) -> Vec<(String, usize)> {
        self.inner
            .streams
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().records.len()))
            .collect()
    }

    /// Circuit state of the bulk-insert guard (for monitoring).
    pub fn circuit_state(&self) -> crate::circuit_breaker::CircuitState {
        self.inner.guard.circuit_state()
    }

    /// Drop all queued records without flushing. Test harness hook only.
    #[cfg(any(test, feature = "test-util"))]
    pub fn clear_all(&self) {
        self.inner.streams.clear();
    }
}

impl BatcherInner {
    /// Flush one stream's queue to the bulk store.
    ///
    /// Swaps the queue for an empty one under the shard lock (concurrent
    /// `put`s land in the fresh queue), then submits the swapped-out batch in
    /// `max_records_per_call` chunks. On any failure the unsent tail is
    /// spliced back ahead of whatever arrived meanwhile.
    async fn flush_stream(&self, stream: &str) -> Result<()> {
        let gate = match self.streams.get(stream) {
            Some(queue) => Arc::clone(&queue.flush_gate),
            None => return Ok(()),
        };
        let _flush = gate.lock().await;

        let (mut batch, oldest) = match self.streams.get_mut(stream) {
            Some(mut queue) => (
                std::mem::take(&mut queue.records),
                queue.oldest_pending.take(),
            ),
            None => return Ok(()),
        };
        if batch.is_empty() {
            return Ok(());
        }

        let store = match self.store.get().await {
            Ok(store) => store,
            Err(err) => {
                self.requeue(stream, batch, oldest);
                return Err(err);
            }
        };

        let total = batch.len();
        let mut sent = 0;
        while sent < total {
            let end = total.min(sent + self.config.max_records_per_call);

            let result = self
                .guard
                .execute(|| {
                    let store = Arc::clone(&store);
                    let chunk = &batch[sent..end];
                    async move { store.insert_batch(stream, chunk).await }
                })
                .await;

            match result {
                Ok(()) => sent = end,
                Err(err) => {
                    let unsent = batch.split_off(sent);
                    self.requeue(stream, unsent, oldest);
                    return Err(err);
                }
            }
        }

        debug!(stream, records = total, "flushed stream");
        Ok(())
    }

    /// Restore a failed batch to the front of the live queue.
    ///
    /// The failed records keep their original order, ahead of any records
    /// appended during the attempt; the saved oldest-pending timestamp is
    /// restored so age-based flush urgency is preserved.
    fn requeue(&self, stream: &str, mut records: Vec<Record>, oldest: Option<Instant>) {
        let restored = records.len();
        let mut queue = self.streams.entry(stream.to_string()).or_default();
        records.extend(queue.records.drain(..));
        queue.records = records;
        queue.oldest_pending = match (oldest, queue.oldest_pending) {
            (Some(saved), Some(current)) => Some(saved.min(current)),
            (saved, current) => saved.or(current),
        };
        warn!(
            stream,
            restored,
            pending = queue.records.len(),
            "requeued failed batch"
        );
    }

    /// Flush every stream whose oldest pending record exceeds the age bound.
    async fn flush_aged(&self) {
        let max_age = self.config.max_batch_age;
        let due: Vec<String> = self
            .streams
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .oldest_pending
                    .is_some_and(|oldest| oldest.elapsed() >= max_age)
            })
            .map(|entry| entry.key().clone())
            .collect();

        for stream in due {
            if let Err(err) = self.flush_stream(&stream).await {
                warn!(stream = %stream, error = %err, "age-triggered flush failed");
            }
        }
    }
}
