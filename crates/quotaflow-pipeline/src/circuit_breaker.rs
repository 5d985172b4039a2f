//! Circuit Breaker for Store Operations
//!
//! This module implements a circuit breaker to stop hammering an external
//! store that is already failing. The breaker has three states:
//!
//! - **Closed**: normal operation, requests pass through
//! - **Open**: too many consecutive failures, reject requests immediately
//! - **HalfOpen**: probing recovery with a single trial request
//!
//! ## State Transitions
//!
//! ```text
//! ┌────────┐  failures >= threshold  ┌──────┐
//! │ Closed │ ─────────────────────> │ Open │
//! └───┬────┘                         └───┬──┘
//!     │                                  │
//!     │ trial succeeds                   │ reset timeout expired
//!     │                                  │
//!     │      ┌──────────┐                │
//!     └───── │ HalfOpen │ <──────────────┘
//!            └─────┬────┘
//!                  │
//!                  │ trial fails
//!                  └──────> Back to Open
//! ```
//!
//! Exactly one caller is admitted as the trial when the reset timeout
//! expires; its outcome alone decides whether the circuit closes or reopens.
//! Other callers keep being rejected while the trial is in flight.
//!
//! State checks are atomic loads, transitions are compare-and-swaps; no
//! background tasks. Time is measured with `tokio::time::Instant`, so tests
//! drive recovery deterministically with a paused clock.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Normal operation - requests pass through
    Closed = 0,
    /// Too many failures - reject requests immediately
    Open = 1,
    /// Probing recovery - a single trial request is in flight
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(value: u8) -> Self {
        match value {
            0 => CircuitState::Closed,
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed, // Default to closed for unknown values
        }
    }
}

/// Configuration for circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening
    pub failure_threshold: u32,
    /// Duration to wait in open state before admitting a trial request
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Circuit breaker guarding one category of store operations.
///
/// All callers of the same category share one instance, so concurrent
/// failures collectively drive it open and every caller benefits once it
/// closes again.
pub struct CircuitBreaker {
    /// Current state (0=Closed, 1=Open, 2=HalfOpen)
    state: AtomicU8,
    /// Consecutive failure count in Closed state
    failure_count: AtomicU64,
    /// When the circuit opened, in microseconds since `origin`
    opened_at: AtomicU64,
    /// Monotonic reference point for `opened_at`
    origin: Instant,
    /// Configuration (fixed at construction)
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    /// Create a new circuit breaker with the given configuration.
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            failure_count: AtomicU64::new(0),
            opened_at: AtomicU64::new(0),
            origin: Instant::now(),
            config,
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Microseconds elapsed since this breaker was created.
    fn now_micros(&self) -> u64 {
        self.origin.elapsed().as_micros() as u64
    }

    /// Check whether a request is allowed (non-blocking).
    ///
    /// Returns `true` if the request should proceed. In `Open` state, once
    /// the reset timeout has elapsed, exactly one caller wins the transition
    /// to `HalfOpen` and becomes the trial; everyone else (including callers
    /// arriving while the trial is in flight) gets `false`.
    pub fn allow_request(&self) -> bool {
        let current_state: CircuitState = self.state.load(Ordering::Acquire).into();

        match current_state {
            CircuitState::Closed => true,

            CircuitState::Open => {
                let opened_at = self.opened_at.load(Ordering::Acquire);
                let elapsed = self.now_micros().saturating_sub(opened_at);

                if elapsed >= self.config.reset_timeout.as_micros() as u64 {
                    // Admit exactly one trial: the CAS winner.
                    self.state
                        .compare_exchange(
                            CircuitState::Open as u8,
                            CircuitState::HalfOpen as u8,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                } else {
                    false // Still in timeout, reject
                }
            }

            // A trial is already in flight; reject until it reports.
            CircuitState::HalfOpen => false,
        }
    }

    /// Report a successful operation.
    pub fn report_success(&self) {
        let current_state: CircuitState = self.state.load(Ordering::Acquire).into();

        match current_state {
            CircuitState::Closed => {
                // Reset the consecutive-failure count
                self.failure_count.store(0, Ordering::Release);
            }

            CircuitState::HalfOpen => {
                // The trial succeeded - the dependency has recovered.
                self.transition_to_closed();
            }

            CircuitState::Open => {
                // Ignore successes in open state (shouldn't happen)
            }
        }
    }

    /// Report a failed operation.
    ///
    /// Callers report one failure per logical operation, after their retry
    /// budget is spent - not one per attempt.
    pub fn report_failure(&self) {
        let current_state: CircuitState = self.state.load(Ordering::Acquire).into();

        match current_state {
            CircuitState::Closed => {
                let failures = self.failure_count.fetch_add(1, Ordering::AcqRel) + 1;
                if failures >= self.config.failure_threshold as u64 {
                    self.transition_to_open();
                }
            }

            CircuitState::HalfOpen => {
                // The trial failed - reopen immediately.
                self.transition_to_open();
            }

            CircuitState::Open => {
                // Already open, ignore additional failures
            }
        }
    }

    fn transition_to_open(&self) {
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        self.opened_at.store(self.now_micros(), Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
    }

    fn transition_to_closed(&self) {
        self.state
            .store(CircuitState::Closed as u8, Ordering::Release);
        self.failure_count.store(0, Ordering::Release);
    }

    /// Get current circuit state (for monitoring).
    pub fn current_state(&self) -> CircuitState {
        self.state.load(Ordering::Acquire).into()
    }

    /// Get current consecutive-failure count (for monitoring).
    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    /// Manually reset the circuit to closed state.
    pub fn reset(&self) {
        self.transition_to_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn breaker(failure_threshold: u32, reset_timeout: Duration) -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig {
            failure_threshold,
            reset_timeout,
        })
    }

    // ---------------------------------------------------------------
    // Closed-state behavior
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn starts_closed() {
        let b = CircuitBreaker::with_defaults();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.allow_request());
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let b = breaker(3, Duration::from_secs(1));

        b.report_failure();
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.allow_request());

        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(!b.allow_request());
    }

    #[tokio::test]
    async fn success_resets_failure_count() {
        let b = breaker(5, Duration::from_secs(30));

        b.report_failure();
        b.report_failure();
        b.report_failure();
        assert_eq!(b.failure_count(), 3);

        b.report_success();
        assert_eq!(b.failure_count(), 0);
        assert_eq!(b.current_state(), CircuitState::Closed);

        // A full threshold of fresh failures is needed again.
        for _ in 0..4 {
            b.report_failure();
        }
        assert_eq!(b.current_state(), CircuitState::Closed);
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);
    }

    // ---------------------------------------------------------------
    // Open-state behavior
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn rejects_while_open() {
        let b = breaker(1, Duration::from_secs(10));
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);

        assert!(!b.allow_request());
        assert!(!b.allow_request());
        assert!(!b.allow_request());
    }

    #[tokio::test]
    async fn open_state_ignores_extra_reports() {
        let b = breaker(1, Duration::from_secs(100));
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);

        b.report_failure();
        b.report_success();
        assert_eq!(b.current_state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn failure_count_resets_on_open() {
        let b = breaker(3, Duration::from_secs(30));
        b.report_failure();
        b.report_failure();
        b.report_failure(); // opens
        assert_eq!(b.current_state(), CircuitState::Open);
        assert_eq!(b.failure_count(), 0);
    }

    // ---------------------------------------------------------------
    // Half-open: single trial admission
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn admits_single_trial_after_reset_timeout() {
        let b = breaker(1, Duration::from_millis(50));
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);

        // Before the timeout: still rejected.
        advance(Duration::from_millis(49)).await;
        assert!(!b.allow_request());

        // After the timeout: exactly one caller is admitted.
        advance(Duration::from_millis(2)).await;
        assert!(b.allow_request());
        assert_eq!(b.current_state(), CircuitState::HalfOpen);
        assert!(!b.allow_request());
        assert!(!b.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn trial_success_closes_circuit() {
        let b = breaker(1, Duration::from_millis(50));
        b.report_failure();

        advance(Duration::from_millis(60)).await;
        assert!(b.allow_request());
        assert_eq!(b.current_state(), CircuitState::HalfOpen);

        b.report_success();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.allow_request());
        assert_eq!(b.failure_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn trial_failure_reopens_circuit() {
        let b = breaker(1, Duration::from_millis(50));
        b.report_failure();

        advance(Duration::from_millis(60)).await;
        assert!(b.allow_request());
        assert_eq!(b.current_state(), CircuitState::HalfOpen);

        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(!b.allow_request());

        // The reopened circuit needs a fresh reset timeout.
        advance(Duration::from_millis(49)).await;
        assert!(!b.allow_request());
        advance(Duration::from_millis(2)).await;
        assert!(b.allow_request());
    }

    #[tokio::test(start_paused = true)]
    async fn full_lifecycle_closed_open_halfopen_closed() {
        let b = breaker(2, Duration::from_millis(50));

        // Phase 1: Closed
        assert!(b.allow_request());

        // Phase 2: Closed -> Open
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Closed);
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);
        assert!(!b.allow_request());

        // Phase 3: Open -> HalfOpen (after timeout)
        advance(Duration::from_millis(60)).await;
        assert!(b.allow_request());
        assert_eq!(b.current_state(), CircuitState::HalfOpen);

        // Phase 4: HalfOpen -> Closed
        b.report_success();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.allow_request());
    }

    // ---------------------------------------------------------------
    // Manual reset
    // ---------------------------------------------------------------

    #[tokio::test]
    async fn manual_reset_closes_circuit() {
        let b = breaker(1, Duration::from_secs(100));
        b.report_failure();
        assert_eq!(b.current_state(), CircuitState::Open);

        b.reset();
        assert_eq!(b.current_state(), CircuitState::Closed);
        assert!(b.allow_request());
    }

    #[tokio::test]
    async fn multiple_open_reset_cycles() {
        let b = breaker(1, Duration::from_secs(100));
        for _ in 0..5 {
            b.report_failure();
            assert_eq!(b.current_state(), CircuitState::Open);
            b.reset();
            assert_eq!(b.current_state(), CircuitState::Closed);
            assert!(b.allow_request());
        }
    }

    // ---------------------------------------------------------------
    // CircuitState conversions
    // ---------------------------------------------------------------

    #[test]
    fn state_from_u8_roundtrip() {
        assert_eq!(CircuitState::from(0u8), CircuitState::Closed);
        assert_eq!(CircuitState::from(1u8), CircuitState::Open);
        assert_eq!(CircuitState::from(2u8), CircuitState::HalfOpen);
    }

    #[test]
    fn state_from_unknown_u8_defaults_to_closed() {
        assert_eq!(CircuitState::from(3u8), CircuitState::Closed);
        assert_eq!(CircuitState::from(255u8), CircuitState::Closed);
    }

    #[test]
    fn default_config_values() {
        let config = CircuitBreakerConfig::default();
        assert_eq!(config.failure_threshold, 5);
        assert_eq!(config.reset_timeout, Duration::from_secs(30));
    }

    #[test]
    fn config_serde_roundtrip() {
        let config = CircuitBreakerConfig {
            failure_threshold: 10,
            reset_timeout: Duration::from_secs(60),
        };
        let json = serde_json::to_string(&config).unwrap();
        let deserialized: CircuitBreakerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.failure_threshold, 10);
        assert_eq!(deserialized.reset_timeout, Duration::from_secs(60));
    }
}
