//! Record and row model.
//!
//! The pipeline treats payloads as opaque JSON objects: a `Record` is whatever
//! a producer hands to the batcher, a `Row` is whatever the backing store
//! returns for a point lookup. No validation happens at this layer - shaping
//! and validating payloads is the caller's job, before a record ever reaches
//! the pipeline.

/// A single record queued for bulk insertion: an opaque key→value mapping.
///
/// Stored and transmitted as-is; field names and value types are only
/// meaningful to the Bulk Store's schema.
pub type Record = serde_json::Map<String, serde_json::Value>;

/// A row returned by the Key-Value Backing Store for a point lookup.
pub type Row = serde_json::Map<String, serde_json::Value>;
