//! Quotaflow Core - Shared Data Model and Store Contracts
//!
//! This crate defines the pieces shared by every layer of the quotaflow
//! pipeline: the opaque record/row model, the two collaborator traits the
//! pipeline talks to (`BulkStore` for batched inserts, `BackingStore` for
//! point lookups), and the store error taxonomy that drives retry and
//! circuit-breaker decisions.
//!
//! # Examples
//!
//! ```ignore
//! use quotaflow_core::{BulkStore, Record, StoreError};
//!
//! struct WarehouseSink { /* client handle */ }
//!
//! #[async_trait::async_trait]
//! impl BulkStore for WarehouseSink {
//!     async fn insert_batch(&self, stream: &str, records: &[Record]) -> Result<(), StoreError> {
//!         // one network round-trip for the whole batch
//!         Ok(())
//!     }
//! }
//! ```

pub mod error;
pub mod record;
pub mod store;

pub use error::{Result, StoreError};
pub use record::{Record, Row};
pub use store::{BackingStore, BulkStore};
