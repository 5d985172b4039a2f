//! Error taxonomy for store operations.
//!
//! Every call into a Bulk Store or Backing Store fails with a `StoreError`.
//! The taxonomy is what the resilience layer keys off:
//!
//! - `Validation` - the store rejected this specific input. Retrying cannot
//!   help, so these short-circuit the retry loop and are never counted
//!   against the circuit breaker.
//! - `Transient` - network partitions, quota exhaustion, backend overload.
//!   Retried with backoff; on exhaustion, counted as one breaker failure.
//! - `Timeout` - an attempt exceeded its deadline. Retryable by default.
//!
//! ## Example
//!
//! ```ignore
//! use quotaflow_core::StoreError;
//!
//! let err = StoreError::Transient("quota exceeded".into());
//! assert!(err.is_retryable());
//!
//! let err = StoreError::Validation("missing required field 'amount'".into());
//! assert!(!err.is_retryable());
//! ```

use thiserror::Error;

/// Convenience alias for `Result<T, StoreError>`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error returned by Bulk Store and Backing Store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store rejected the input itself (malformed record, bad key).
    ///
    /// Fatal: propagated immediately to the caller, never retried, never
    /// counted toward circuit-breaker failures.
    #[error("invalid input: {0}")]
    Validation(String),

    /// A transient failure of the dependency (network, quota, overload).
    ///
    /// Drives the retry loop and, once the retry budget is exhausted,
    /// circuit-breaker accounting.
    #[error("transient store failure: {0}")]
    Transient(String),

    /// An attempt exceeded its per-call deadline.
    #[error("store operation timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl StoreError {
    /// Whether retrying this error could plausibly succeed.
    ///
    /// `Timeout` reports `true` here; a retry policy may still choose to
    /// treat timeouts as fatal (see `RetryPolicy::retry_on_timeout`).
    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Validation(_) => false,
            StoreError::Transient(_) => true,
            StoreError::Timeout(_) => true,
        }
    }
}
