//! Collaborator traits consumed by the pipeline.
//!
//! The pipeline core never talks to a concrete backend. It is wired against
//! two narrow, function-shaped boundaries:
//!
//! - [`BulkStore`] - an append-only sink that accepts batched record inserts
//!   (an analytical warehouse, typically).
//! - [`BackingStore`] - a point-lookup source consulted on cache miss.
//!
//! Both are object-safe so they can live behind `Arc<dyn …>` and be swapped
//! for in-memory fakes in tests.

use crate::error::Result;
use crate::record::{Record, Row};
use async_trait::async_trait;

/// External append-only data sink accepting batched record inserts.
///
/// A single call must accept at least the pipeline's configured
/// records-per-call cap; the batcher never submits more than that in one
/// call, splitting larger queues into sequential calls.
#[async_trait]
pub trait BulkStore: Send + Sync {
    /// Insert a batch of records into the named stream.
    ///
    /// Succeeds or fails as a unit: a failure means none of the records in
    /// this call are known to be durable, and the batcher will re-queue all
    /// of them.
    async fn insert_batch(&self, stream: &str, records: &[Record]) -> Result<()>;
}

/// External point-lookup data source consulted on cache miss.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Look up a single row by key. `Ok(None)` means the key does not exist
    /// (as opposed to the store being unreachable, which is an `Err`).
    async fn query(&self, key: &str) -> Result<Option<Row>>;
}
