//! Error types for pipeline operations.
//!
//! Callers see exactly three failure shapes beyond the store's own errors:
//!
//! - `CircuitOpen` - the dependency is presumed down; the call failed fast
//!   without contacting it. Distinct from a store error so callers can tell
//!   "dependency down" apart from "dependency rejected this input".
//! - `ConnectFailed` - the lazy store connector failed once and the failure
//!   is cached; every later call fails with the same message until restart.
//! - `Config` - the pipeline was assembled without a required collaborator.
//!
//! Flush failures inside the batcher are absorbed by re-queuing and never
//! reach producers; only explicitly awaited flushes and cache fills surface
//! a `PipelineError`.

use quotaflow_core::StoreError;
use thiserror::Error;

/// Convenience alias for `Result<T, PipelineError>`.
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error returned by guarded pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The circuit for this operation category is open; the dependency was
    /// not contacted. Try again after the breaker's reset timeout.
    #[error("circuit '{category}' is open; request rejected without contacting the store")]
    CircuitOpen {
        /// Protected operation category, e.g. `bulk-insert`.
        category: String,
    },

    /// The underlying store failed after the retry budget was spent (or
    /// immediately, for validation errors).
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Connecting to the store failed; the failure is cached and every
    /// subsequent call short-circuits here until the process restarts.
    #[error("store connection failed: {0}")]
    ConnectFailed(String),

    /// The pipeline builder was missing a required piece.
    #[error("configuration error: {0}")]
    Config(String),
}

impl PipelineError {
    /// True if this is the fail-fast breaker rejection.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, PipelineError::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circuit_open_names_category() {
        let err = PipelineError::CircuitOpen {
            category: "bulk-insert".to_string(),
        };
        assert!(err.is_circuit_open());
        assert!(err.to_string().contains("bulk-insert"));
    }

    #[test]
    fn store_error_is_transparent() {
        let err = PipelineError::from(StoreError::Transient("overloaded".into()));
        assert!(!err.is_circuit_open());
        assert_eq!(err.to_string(), "transient store failure: overloaded");
    }

    #[test]
    fn connect_failure_keeps_message() {
        let err = PipelineError::ConnectFailed("bad credentials".into());
        assert!(err.to_string().contains("bad credentials"));
    }
}
