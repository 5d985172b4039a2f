//! End-to-end tests for the pipeline facade: batched writes, read-through
//! caching, and the resilience layer working together against in-memory
//! stores.

use async_trait::async_trait;
use quotaflow_core::{BackingStore, BulkStore, Record, Row, StoreError};
use quotaflow_pipeline::{
    cache_key, CacheResult, CircuitBreakerConfig, Pipeline, PipelineError, RetryPolicy,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::{advance, sleep};

/// Bulk store that records batches; calls listed in `fail_calls` (1-indexed)
/// fail with a transient error.
struct RecordingBulkStore {
    batches: Mutex<Vec<(String, Vec<Record>)>>,
    calls: AtomicUsize,
    fail_calls: Mutex<Vec<usize>>,
}

impl RecordingBulkStore {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            batches: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            fail_calls: Mutex::new(Vec::new()),
        })
    }

    fn fail_calls(&self, calls: &[usize]) {
        *self.fail_calls.lock().unwrap() = calls.to_vec();
    }

    fn batches(&self) -> Vec<(String, Vec<Record>)> {
        self.batches.lock().unwrap().clone()
    }

    fn batch_count(&self) -> usize {
        self.batches.lock().unwrap().len()
    }
}

#[async_trait]
impl BulkStore for RecordingBulkStore {
    async fn insert_batch(&self, stream: &str, records: &[Record]) -> Result<(), StoreError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_calls.lock().unwrap().contains(&call) {
            return Err(StoreError::Transient("insert quota exceeded".into()));
        }
        self.batches
            .lock()
            .unwrap()
            .push((stream.to_string(), records.to_vec()));
        Ok(())
    }
}

/// Backing store over a fixed row map, counting queries; can be forced to
/// fail every call.
struct MapBackingStore {
    rows: HashMap<String, Row>,
    queries: AtomicUsize,
    failing: std::sync::atomic::AtomicBool,
}

impl MapBackingStore {
    fn new(rows: impl IntoIterator<Item = (String, Row)>) -> Arc<Self> {
        Arc::new(Self {
            rows: rows.into_iter().collect(),
            queries: AtomicUsize::new(0),
            failing: std::sync::atomic::AtomicBool::new(false),
        })
    }

    fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BackingStore for MapBackingStore {
    async fn query(&self, key: &str) -> Result<Option<Row>, StoreError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(StoreError::Transient("read quota exceeded".into()));
        }
        Ok(self.rows.get(key).cloned())
    }
}

fn record(seq: u64) -> Record {
    let mut map = Record::new();
    map.insert("seq".to_string(), serde_json::json!(seq));
    map
}

fn row(total: u64) -> Row {
    let mut map = Row::new();
    map.insert("total".to_string(), serde_json::json!(total));
    map
}

/// Retry policy with a tiny, deterministic budget for failure tests.
fn single_attempt() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::from_millis(1),
        backoff_multiplier: 2.0,
        max_delay: Duration::from_millis(10),
        jitter: false,
        retry_on_timeout: true,
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(1)).await;
    }
    panic!("condition not met in time");
}

// ============================================================================
// Batched writes
// ============================================================================

#[tokio::test(start_paused = true)]
async fn two_puts_at_threshold_yield_one_bulk_call() {
    let bulk = RecordingBulkStore::new();
    let backing = MapBackingStore::new([]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk.clone())
        .backing_store(backing)
        .max_batch_records(2)
        .build()
        .await
        .unwrap();

    pipeline.batch_write("payments", record(1));
    pipeline.batch_write("payments", record(2));

    let probe = bulk.clone();
    wait_until(move || probe.batch_count() == 1).await;

    let batches = bulk.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].0, "payments");
    assert_eq!(batches[0].1, vec![record(1), record(2)]);
    assert_eq!(pipeline.batcher().queue_depth("payments"), 0);

    pipeline.close().await;
}

#[tokio::test(start_paused = true)]
async fn sweeper_delivers_low_traffic_stream_within_age_bound() {
    let bulk = RecordingBulkStore::new();
    let backing = MapBackingStore::new([]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk.clone())
        .backing_store(backing)
        .max_batch_records(1000)
        .max_batch_age(Duration::from_millis(200))
        .build()
        .await
        .unwrap();

    pipeline.batch_write("audit", record(1));

    let probe = bulk.clone();
    wait_until(move || probe.batch_count() == 1).await;
    assert_eq!(bulk.batches()[0].1, vec![record(1)]);

    pipeline.close().await;
}

#[tokio::test]
async fn rejected_batch_is_retried_ahead_of_later_records() {
    let bulk = RecordingBulkStore::new();
    let backing = MapBackingStore::new([]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk.clone())
        .backing_store(backing)
        .retry_policy(single_attempt())
        .build()
        .await
        .unwrap();

    pipeline.batch_write("payments", record(1));
    pipeline.batch_write("payments", record(2));

    bulk.fail_calls(&[1]);
    assert!(pipeline.batcher().flush("payments").await.is_err());
    assert_eq!(pipeline.batcher().queue_depth("payments"), 2);

    pipeline.batch_write("payments", record(3));
    pipeline.batcher().flush("payments").await.unwrap();

    let batches = bulk.batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].1, vec![record(1), record(2), record(3)]);

    pipeline.close().await;
}

#[tokio::test]
async fn close_flushes_pending_records() {
    let bulk = RecordingBulkStore::new();
    let backing = MapBackingStore::new([]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk.clone())
        .backing_store(backing)
        .build()
        .await
        .unwrap();

    pipeline.batch_write("payments", record(1));
    pipeline.batch_write("audit", record(2));
    pipeline.close().await;

    assert_eq!(bulk.batch_count(), 2);
}

// ============================================================================
// Read-through caching
// ============================================================================

#[tokio::test(start_paused = true)]
async fn lookup_caches_rows_for_the_ttl_window() {
    let bulk = RecordingBulkStore::new();
    let key = cache_key("order", "42", "total");
    let backing = MapBackingStore::new([(key.clone(), row(100))]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk)
        .backing_store(backing.clone())
        .build()
        .await
        .unwrap();

    // Miss → one store query, row cached.
    let found = pipeline.lookup(&key, Duration::from_millis(5000)).await.unwrap();
    assert_eq!(found, Some(row(100)));
    assert_eq!(backing.query_count(), 1);

    // Within the TTL: served from cache, store untouched.
    let found = pipeline.lookup(&key, Duration::from_millis(5000)).await.unwrap();
    assert_eq!(found, Some(row(100)));
    assert_eq!(backing.query_count(), 1);

    // After the TTL: logically absent, store queried again.
    advance(Duration::from_millis(6000)).await;
    assert_eq!(pipeline.cached_lookup(&key), CacheResult::Miss);
    let found = pipeline.lookup(&key, Duration::from_millis(5000)).await.unwrap();
    assert_eq!(found, Some(row(100)));
    assert_eq!(backing.query_count(), 2);

    pipeline.close().await;
}

#[tokio::test]
async fn external_fill_through_the_cache_handle() {
    let bulk = RecordingBulkStore::new();
    let backing = MapBackingStore::new([]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk)
        .backing_store(backing)
        .build()
        .await
        .unwrap();

    // Caller computes the value on miss and writes it back.
    assert_eq!(pipeline.cached_lookup("order:42:total"), CacheResult::Miss);
    pipeline
        .cache()
        .put("order:42:total", row(100), Duration::from_secs(5));

    match pipeline.cached_lookup("order:42:total") {
        CacheResult::Hit { value, hit_count } => {
            assert_eq!(value, row(100));
            assert_eq!(hit_count, 1);
        }
        CacheResult::Miss => panic!("expected hit"),
    }

    pipeline.close().await;
}

#[tokio::test]
async fn absent_rows_are_not_cached() {
    let bulk = RecordingBulkStore::new();
    let backing = MapBackingStore::new([]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk)
        .backing_store(backing.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(
        pipeline.lookup("ghost", Duration::from_secs(5)).await.unwrap(),
        None
    );
    assert_eq!(
        pipeline.lookup("ghost", Duration::from_secs(5)).await.unwrap(),
        None
    );
    // Every miss reached the store: nothing was memoized.
    assert_eq!(backing.query_count(), 2);

    pipeline.close().await;
}

// ============================================================================
// Resilience across the facade
// ============================================================================

#[tokio::test]
async fn lookup_circuit_opens_and_fails_fast() {
    let bulk = RecordingBulkStore::new();
    let key = cache_key("dealer", "D-1044", "summary");
    let backing = MapBackingStore::new([(key.clone(), row(7))]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk)
        .backing_store(backing.clone())
        .retry_policy(single_attempt())
        .circuit(CircuitBreakerConfig {
            failure_threshold: 2,
            reset_timeout: Duration::from_secs(30),
        })
        .build()
        .await
        .unwrap();

    backing.set_failing(true);
    for _ in 0..2 {
        let err = pipeline.lookup(&key, Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::Store(_)));
    }
    assert_eq!(backing.query_count(), 2);

    // Circuit open: rejected without contacting the store.
    let err = pipeline.lookup(&key, Duration::from_secs(5)).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(backing.query_count(), 2);

    pipeline.close().await;
}

#[tokio::test]
async fn bulk_and_lookup_circuits_are_independent() {
    let bulk = RecordingBulkStore::new();
    let key = cache_key("dealer", "D-1044", "summary");
    let backing = MapBackingStore::new([(key.clone(), row(7))]);
    let pipeline = Pipeline::builder()
        .bulk_store(bulk.clone())
        .backing_store(backing.clone())
        .retry_policy(single_attempt())
        .circuit(CircuitBreakerConfig {
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(30),
        })
        .build()
        .await
        .unwrap();

    // Trip the bulk-insert circuit.
    bulk.fail_calls(&[1]);
    pipeline.batch_write("payments", record(1));
    assert!(pipeline.batcher().flush("payments").await.is_err());
    let err = pipeline.batcher().flush("payments").await.unwrap_err();
    assert!(err.is_circuit_open());

    // Lookups are unaffected.
    let found = pipeline.lookup(&key, Duration::from_secs(5)).await.unwrap();
    assert_eq!(found, Some(row(7)));

    // Records kept accumulating, visible through the monitoring hook.
    pipeline.batch_write("payments", record(2));
    assert_eq!(pipeline.queue_depths(), vec![("payments".to_string(), 2)]);

    pipeline.close().await;
}

#[tokio::test]
async fn failed_backing_connect_is_cached() {
    let bulk = RecordingBulkStore::new();
    let dials = Arc::new(AtomicUsize::new(0));
    let counter = dials.clone();

    let pipeline = Pipeline::builder()
        .bulk_store(bulk)
        .backing_store_with(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Arc<dyn BackingStore>, _>(StoreError::Transient(
                    "credentials rejected".into(),
                ))
            }
        })
        .build()
        .await
        .unwrap();

    for _ in 0..3 {
        let err = pipeline.lookup("k", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, PipelineError::ConnectFailed(_)));
    }
    // The bad configuration was dialed exactly once.
    assert_eq!(dials.load(Ordering::SeqCst), 1);

    pipeline.close().await;
}
