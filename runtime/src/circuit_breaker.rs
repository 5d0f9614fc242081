//! Circuit breaker guarding calls to an unreliable dependency.
//!
//! The sync fabric publishes through one breaker per process so a broker
//! outage turns into immediate `Open` rejections (parked in the outbox)
//! instead of every ledger write waiting on a dead connection.
//!
//! # States
//!
//! - **Closed**: calls pass through; consecutive failures are counted
//! - **Open**: calls are rejected until `open_timeout` has elapsed
//! - **HalfOpen**: calls pass through; `success_threshold` successes close the
//!   circuit, any failure reopens it
//!
//! # Example
//!
//! ```rust
//! use flashdrop_runtime::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, State};
//! use std::time::Duration;
//!
//! # async fn example() {
//! let breaker = CircuitBreaker::new(
//!     "sync.publish",
//!     CircuitBreakerConfig::builder()
//!         .failure_threshold(5)
//!         .open_timeout(Duration::from_secs(10))
//!         .build(),
//! );
//!
//! let result = breaker.call(|| async { Ok::<_, String>(()) }).await;
//! assert!(result.is_ok());
//! assert_eq!(breaker.state(), State::Closed);
//! # }
//! ```

use crate::metrics::CircuitBreakerMetrics;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Time spent open before a trial call is allowed
    pub open_timeout: Duration,
    /// Successes in `HalfOpen` needed to close the circuit
    pub success_threshold: usize,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            open_timeout: Duration::from_secs(30),
            success_threshold: 2,
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration builder.
    #[must_use]
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder {
            config: Self::default(),
        }
    }
}

/// Builder for [`CircuitBreakerConfig`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Set the failure threshold (minimum 1).
    #[must_use]
    pub fn failure_threshold(mut self, threshold: usize) -> Self {
        self.config.failure_threshold = threshold.max(1);
        self
    }

    /// Set how long the circuit stays open.
    #[must_use]
    pub const fn open_timeout(mut self, duration: Duration) -> Self {
        self.config.open_timeout = duration;
        self
    }

    /// Set the success threshold (minimum 1).
    #[must_use]
    pub fn success_threshold(mut self, threshold: usize) -> Self {
        self.config.success_threshold = threshold.max(1);
        self
    }

    /// Build the configuration.
    #[must_use]
    pub fn build(self) -> CircuitBreakerConfig {
        self.config
    }
}

/// Circuit breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Requests pass through normally
    Closed,
    /// Requests fail immediately
    Open,
    /// Trial requests pass through
    HalfOpen,
}

impl State {
    /// Label used in logs and the state gauge.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }

    const fn gauge_value(self) -> f64 {
        match self {
            Self::Closed => 0.0,
            Self::HalfOpen => 1.0,
            Self::Open => 2.0,
        }
    }
}

/// Errors from circuit breaker calls.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open, the operation was not attempted
    #[error("Circuit breaker is open")]
    Open,
    /// The operation ran and failed
    #[error("Operation failed: {0}")]
    Inner(E),
}

#[derive(Debug)]
struct Inner {
    state: State,
    failure_count: usize,
    success_count: usize,
    opened_at: Option<Instant>,
}

/// Call counters of one breaker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BreakerStats {
    /// Calls attempted or rejected
    pub total_calls: u64,
    /// Calls that succeeded
    pub total_successes: u64,
    /// Calls that ran and failed
    pub total_failures: u64,
    /// Calls rejected while open
    pub total_rejections: u64,
}

/// Circuit breaker shared by every caller of one dependency.
///
/// Cloning is cheap and clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: &'static str,
    config: Arc<CircuitBreakerConfig>,
    inner: Arc<Mutex<Inner>>,
    total_calls: Arc<AtomicU64>,
    total_successes: Arc<AtomicU64>,
    total_failures: Arc<AtomicU64>,
    total_rejections: Arc<AtomicU64>,
}

impl CircuitBreaker {
    /// Create a closed breaker.
    #[must_use]
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        CircuitBreakerMetrics::record_state(name, State::Closed.gauge_value());
        Self {
            name,
            config: Arc::new(config),
            inner: Arc::new(Mutex::new(Inner {
                state: State::Closed,
                failure_count: 0,
                success_count: 0,
                opened_at: None,
            })),
            total_calls: Arc::new(AtomicU64::new(0)),
            total_successes: Arc::new(AtomicU64::new(0)),
            total_failures: Arc::new(AtomicU64::new(0)),
            total_rejections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Name used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> State {
        self.lock().state
    }

    /// Run `operation` unless the circuit is open.
    ///
    /// # Errors
    ///
    /// - [`CircuitBreakerError::Open`] if the call was rejected
    /// - [`CircuitBreakerError::Inner`] if the operation failed
    pub async fn call<F, Fut, T, E>(&self, operation: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.total_calls.fetch_add(1, Ordering::Relaxed);

        if !self.try_acquire() {
            self.total_rejections.fetch_add(1, Ordering::Relaxed);
            CircuitBreakerMetrics::record_rejection(self.name);
            tracing::debug!(breaker = self.name, "Circuit breaker open, rejecting call");
            return Err(CircuitBreakerError::Open);
        }

        match operation().await {
            Ok(result) => {
                self.total_successes.fetch_add(1, Ordering::Relaxed);
                self.on_success();
                Ok(result)
            }
            Err(err) => {
                self.total_failures.fetch_add(1, Ordering::Relaxed);
                self.on_failure();
                Err(CircuitBreakerError::Inner(err))
            }
        }
    }

    /// Counters since creation.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            total_calls: self.total_calls.load(Ordering::Relaxed),
            total_successes: self.total_successes.load(Ordering::Relaxed),
            total_failures: self.total_failures.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
        }
    }

    /// Force the circuit closed.
    pub fn reset(&self) {
        let mut inner = self.lock();
        self.transition(&mut inner, State::Closed);
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // State is plain counters, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_acquire(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            State::Closed | State::HalfOpen => true,
            State::Open => {
                let elapsed = inner
                    .opened_at
                    .is_none_or(|at| at.elapsed() >= self.config.open_timeout);
                if elapsed {
                    self.transition(&mut inner, State::HalfOpen);
                    inner.success_count = 0;
                }
                elapsed
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::Closed | State::Open => inner.failure_count = 0,
            State::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.transition(&mut inner, State::Closed);
                    inner.failure_count = 0;
                    inner.success_count = 0;
                    inner.opened_at = None;
                }
            }
        }
    }

    fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            State::Closed => {
                inner.failure_count += 1;
                if inner.failure_count >= self.config.failure_threshold {
                    self.transition(&mut inner, State::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            State::HalfOpen => {
                self.transition(&mut inner, State::Open);
                inner.opened_at = Some(Instant::now());
                inner.failure_count = 1;
                inner.success_count = 0;
            }
            State::Open => inner.failure_count += 1,
        }
    }

    fn transition(&self, inner: &mut Inner, to: State) {
        if inner.state == to {
            return;
        }
        tracing::warn!(
            breaker = self.name,
            from = inner.state.as_str(),
            to = to.as_str(),
            failures = inner.failure_count,
            "Circuit breaker state change"
        );
        inner.state = to;
        CircuitBreakerMetrics::record_state(self.name, to.gauge_value());
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn breaker(failures: usize, open_for: Duration) -> CircuitBreaker {
        CircuitBreaker::new(
            "test",
            CircuitBreakerConfig::builder()
                .failure_threshold(failures)
                .open_timeout(open_for)
                .success_threshold(2)
                .build(),
        )
    }

    async fn fail(breaker: &CircuitBreaker) {
        let _ = breaker.call(|| async { Err::<(), _>("boom") }).await;
    }

    #[tokio::test]
    async fn opens_after_consecutive_failures_and_rejects() {
        let breaker = breaker(2, Duration::from_secs(60));
        fail(&breaker).await;
        assert_eq!(breaker.state(), State::Closed);
        fail(&breaker).await;
        assert_eq!(breaker.state(), State::Open);

        let result = breaker.call(|| async { Ok::<_, String>(1) }).await;
        assert_eq!(result, Err(CircuitBreakerError::Open));
        assert_eq!(breaker.stats().total_rejections, 1);
    }

    #[tokio::test]
    async fn success_resets_the_failure_streak() {
        let breaker = breaker(2, Duration::from_secs(60));
        fail(&breaker).await;
        breaker.call(|| async { Ok::<_, String>(()) }).await.unwrap();
        fail(&breaker).await;
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_closes_after_enough_successes() {
        let breaker = breaker(1, Duration::from_millis(20));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        breaker.call(|| async { Ok::<_, String>(()) }).await.unwrap();
        assert_eq!(breaker.state(), State::HalfOpen);
        breaker.call(|| async { Ok::<_, String>(()) }).await.unwrap();
        assert_eq!(breaker.state(), State::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens() {
        let breaker = breaker(1, Duration::from_millis(20));
        fail(&breaker).await;
        tokio::time::sleep(Duration::from_millis(40)).await;
        fail(&breaker).await;
        assert_eq!(breaker.state(), State::Open);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let breaker = breaker(1, Duration::from_secs(60));
        let clone = breaker.clone();
        fail(&clone).await;
        assert_eq!(breaker.state(), State::Open);
        breaker.reset();
        assert_eq!(clone.state(), State::Closed);
    }
}
