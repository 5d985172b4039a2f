//! Retry Logic with Exponential Backoff
//!
//! This module implements the retry half of the resilience layer: transient
//! store failures are retried with exponentially growing delays, fatal
//! failures short-circuit immediately.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────┐
//! │  RetryPolicy               │
//! │  - max_attempts: 4         │
//! │  - base_delay: 100ms       │
//! │  - backoff_multiplier: 2.0 │
//! │  - max_delay: 30s          │
//! └──────┬─────────────────────┘
//!        │
//!        ├─→ Attempt 1: immediate
//!        ├─→ Attempt 2: wait 100ms
//!        ├─→ Attempt 3: wait 200ms
//!        └─→ Attempt 4: wait 400ms
//! ```
//!
//! ## Retryable vs Fatal Errors
//!
//! **Retryable** (transient failures):
//! - `StoreError::Transient`: network partition, quota exhaustion, overload
//! - `StoreError::Timeout`: attempt deadline exceeded (unless the policy
//!   marks timeouts fatal)
//!
//! **Fatal** (won't succeed on retry):
//! - `StoreError::Validation`: the store rejected this specific input
//!
//! Each attempt runs under its own deadline (`attempt_timeout`); an elapsed
//! deadline is converted into `StoreError::Timeout` and classified like any
//! other error. Delays suspend only the calling task - concurrent pipeline
//! work proceeds while a retry sleeps.

use quotaflow_core::StoreError;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Retry policy configuration for exponential backoff.
///
/// # Backoff Calculation
///
/// ```text
/// delay before attempt n (n >= 2) = min(base_delay * multiplier^(n-2), max_delay)
///
/// Example with defaults (100ms base, 2x multiplier, 30s max):
/// - Attempt 1: immediate
/// - Attempt 2: 100ms
/// - Attempt 3: 200ms
/// - Attempt 4: 400ms
/// ```
///
/// `max_attempts` counts total attempts, so `max_attempts: 1` means no
/// retries at all.
///
/// # Jitter
///
/// With `jitter` enabled each delay is scaled by a random factor in
/// [0.75, 1.25) so a fleet of callers recovering from the same outage does
/// not hammer the store in lockstep. Off by default: delays are then exactly
/// the formula above, which is what deterministic tests want.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total number of attempts (first call included).
    pub max_attempts: u32,

    /// Delay before the second attempt.
    pub base_delay: Duration,

    /// Multiplier applied for each further attempt.
    pub backoff_multiplier: f64,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Scale each delay by a random factor in [0.75, 1.25).
    pub jitter: bool,

    /// Whether a timed-out attempt is worth retrying (default: true).
    pub retry_on_timeout: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            base_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
            retry_on_timeout: true,
        }
    }
}

impl RetryPolicy {
    /// Calculate the backoff delay after `failures` failed attempts.
    ///
    /// `backoff(0)` is the delay before attempt 2, `backoff(1)` before
    /// attempt 3, and so on. Jitter is applied by the retry loop, not here,
    /// so this function stays deterministic.
    pub fn backoff(&self, failures: u32) -> Duration {
        let delay_ms =
            self.base_delay.as_millis() as f64 * self.backoff_multiplier.powi(failures as i32);
        Duration::from_millis(delay_ms as u64).min(self.max_delay)
    }

    /// Classify an error: `true` if another attempt could plausibly succeed.
    pub fn is_retryable(&self, err: &StoreError) -> bool {
        match err {
            StoreError::Validation(_) => false,
            StoreError::Transient(_) => true,
            StoreError::Timeout(_) => self.retry_on_timeout,
        }
    }
}

/// Retry an async store operation with exponential backoff.
///
/// # Arguments
///
/// * `policy` - Retry policy configuration
/// * `attempt_timeout` - Deadline applied to every individual attempt
/// * `operation` - Async operation to retry
///
/// # Behavior
///
/// 1. Run the operation under `attempt_timeout`.
/// 2. On success, return the result.
/// 3. On a fatal error, return it immediately.
/// 4. On a retryable error with budget remaining: sleep the backoff delay,
///    then try again.
/// 5. Once `max_attempts` have failed, return the last error.
///
/// The caller decides what the final error means for circuit-breaker
/// accounting; this function only exhausts the retry budget.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    attempt_timeout: Duration,
    mut operation: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt: u32 = 1;

    loop {
        let outcome = match timeout(attempt_timeout, operation()).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout(attempt_timeout)),
        };

        match outcome {
            Ok(value) => {
                if attempt > 1 {
                    debug!(attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => {
                if !policy.is_retryable(&err) {
                    warn!(error = %err, "fatal error, giving up");
                    return Err(err);
                }

                if attempt >= policy.max_attempts {
                    warn!(
                        attempt,
                        max_attempts = policy.max_attempts,
                        error = %err,
                        "retry budget exhausted, giving up"
                    );
                    return Err(err);
                }

                let mut delay = policy.backoff(attempt - 1);
                if policy.jitter {
                    let factor = 0.75 + rand::random::<f64>() * 0.5;
                    delay = Duration::from_millis((delay.as_millis() as f64 * factor) as u64);
                }

                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "retryable error, backing off"
                );

                sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
