//! Quotaflow Pipeline - Quota-Optimized Writes and Reads
//!
//! This crate implements the three cooperating mechanisms that keep a
//! metered external store affordable under load:
//!
//! - **Micro-batcher** ([`Batcher`]): buffers individual record inserts per
//!   stream and flushes them in bulk on size or age thresholds, so the store
//!   sees one call per batch instead of one per record.
//! - **TTL cache** ([`TtlCache`]): memoizes point lookups for a bounded
//!   freshness window with per-entry TTLs and hit bookkeeping.
//! - **Resilience layer** ([`Resilience`]): retry-with-backoff plus a
//!   circuit breaker around every store call, so a struggling dependency is
//!   retried politely and a dead one is not hammered at all.
//!
//! [`Pipeline`] composes the three behind the two calls most applications
//! need: `batch_write` and `lookup`.
//!
//! # Examples
//!
//! ```ignore
//! use quotaflow_pipeline::Pipeline;
//! use std::time::Duration;
//!
//! let pipeline = Pipeline::builder()
//!     .bulk_store(warehouse)
//!     .backing_store(lookup_store)
//!     .max_batch_records(500)
//!     .build()
//!     .await?;
//!
//! // Fire-and-forget; flushed in bulk within max_batch_age.
//! pipeline.batch_write("payments", record);
//!
//! // Cached for 5 minutes; at most one store query per window.
//! let row = pipeline.lookup("dealer:D-1044:summary", Duration::from_secs(300)).await?;
//! ```

pub mod batcher;
pub mod cache;
pub mod circuit_breaker;
pub mod connect;
pub mod error;
pub mod pipeline;
pub mod resilience;
pub mod retry;

pub use batcher::{Batcher, BatcherConfig};
pub use cache::{cache_key, CacheMetrics, CacheResult, EntryInfo, TtlCache};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use connect::LazyStore;
pub use error::{PipelineError, Result};
pub use pipeline::{Pipeline, PipelineBuilder, PipelineConfig};
pub use resilience::Resilience;
pub use retry::{retry_with_backoff, RetryPolicy};
