//! Resilient Execution of Store Operations
//!
//! [`Resilience`] ties the retry loop and the circuit breaker together into a
//! single guard for one category of store calls ("bulk-insert",
//! "backing-store-query"). All callers of a category share one instance, so
//! its breaker sees the category's collective health.
//!
//! ## Call Flow
//!
//! ```text
//! execute(op)
//!    │
//!    ├─ breaker rejects? ──→ Err(CircuitOpen)   (op never invoked)
//!    │
//!    ├─ retry loop: attempt, backoff, attempt, ... (per-attempt timeout)
//!    │
//!    ├─ Ok(value)          ──→ report_success, return value
//!    ├─ Err(retryable)     ──→ report_failure ONCE, propagate
//!    └─ Err(validation)    ──→ propagate, breaker untouched
//! ```
//!
//! A retried call counts as a single failure event against the breaker, no
//! matter how many attempts it burned - otherwise one struggling caller's
//! retries would trip the circuit for everyone.

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::error::{PipelineError, Result};
use crate::retry::{retry_with_backoff, RetryPolicy};
use quotaflow_core::StoreError;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry-with-backoff plus circuit breaker around one category of fallible
/// store operations.
pub struct Resilience {
    /// Category label used in logs and in `CircuitOpen` errors.
    category: String,
    retry: RetryPolicy,
    breaker: CircuitBreaker,
    /// Deadline applied to every individual attempt.
    attempt_timeout: Duration,
}

impl Resilience {
    /// Create a guard for one operation category.
    pub fn new(
        category: impl Into<String>,
        retry: RetryPolicy,
        circuit: CircuitBreakerConfig,
        attempt_timeout: Duration,
    ) -> Self {
        Self {
            category: category.into(),
            retry,
            breaker: CircuitBreaker::new(circuit),
            attempt_timeout,
        }
    }

    /// Execute an operation under retry and circuit-breaker protection.
    ///
    /// # Errors
    ///
    /// - `PipelineError::CircuitOpen` if the breaker rejected the call; the
    ///   operation was never invoked.
    /// - `PipelineError::Store` carrying the operation's last error once the
    ///   retry budget is spent (transient) or immediately (validation).
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        if !self.breaker.allow_request() {
            warn!(category = %self.category, "circuit open, rejecting without store call");
            return Err(PipelineError::CircuitOpen {
                category: self.category.clone(),
            });
        }

        match retry_with_backoff(&self.retry, self.attempt_timeout, operation).await {
            Ok(value) => {
                self.breaker.report_success();
                Ok(value)
            }
            Err(err) => {
                // One failure event per outer call; validation failures mean
                // the dependency is healthy and don't count against it.
                if self.retry.is_retryable(&err) {
                    self.breaker.report_failure();
                }
                Err(err.into())
            }
        }
    }

    /// Category label this guard protects.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// Current breaker state (for monitoring).
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.current_state()
    }

    /// Current consecutive-failure count (for monitoring).
    pub fn failure_count(&self) -> u64 {
        self.breaker.failure_count()
    }

    /// Manually close the breaker.
    pub fn reset(&self) {
        self.breaker.reset();
    }
}
