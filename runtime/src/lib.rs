//! # Flashdrop Runtime
//!
//! Resilience and observability plumbing shared by the drop services.
//!
//! ## Components
//!
//! - **Retry**: exponential backoff with jitter and a retryability predicate
//! - **Circuit breaker**: fail fast while a dependency is down
//! - **Outbox**: bounded buffer of work parked for a later retry
//! - **Metrics**: infrastructure metric descriptions and the Prometheus endpoint
//! - **Health**: per-component checks rolled up into a [`HealthReport`]

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use serde::Serialize;

/// Retry logic with exponential backoff
pub mod retry;

/// Circuit breaker pattern for preventing cascading failures
pub mod circuit_breaker;

/// Prometheus metrics for observability
pub mod metrics;

/// Bounded outbox for parked work
pub mod outbox;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
pub use outbox::{Outbox, OutboxEntry};
pub use retry::{RetryPolicy, retry_with_backoff, retry_with_predicate};

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Component is fully operational
    Healthy,

    /// Component is operational but experiencing issues (e.g. a growing outbox)
    Degraded,

    /// Component is not operational
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Get the worst status between two statuses
    #[must_use]
    pub const fn worst(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unhealthy, _) | (_, Self::Unhealthy) => Self::Unhealthy,
            (Self::Degraded, _) | (_, Self::Degraded) => Self::Degraded,
            _ => Self::Healthy,
        }
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unhealthy => "unhealthy",
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health check result for one component
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthCheck {
    /// Name of the component being checked
    pub component: String,

    /// Current health status
    pub status: HealthStatus,

    /// Optional message providing details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Extra key/value details (sizes, latencies, states)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<(String, String)>,
}

impl HealthCheck {
    /// Create a healthy check result
    #[must_use]
    pub fn healthy(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            message: None,
            metadata: Vec::new(),
        }
    }

    /// Create a degraded check result
    #[must_use]
    pub fn degraded(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Degraded,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Create an unhealthy check result
    #[must_use]
    pub fn unhealthy(component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
            metadata: Vec::new(),
        }
    }

    /// Add metadata to the health check
    #[must_use]
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.metadata.push((key.into(), value.to_string()));
        self
    }

    /// Check an outbox: degraded once it holds `degraded_at` or more entries.
    #[must_use]
    pub fn for_outbox<T>(outbox: &Outbox<T>, degraded_at: usize) -> Self {
        let len = outbox.len();
        let check = if len >= degraded_at {
            Self::degraded(
                format!("outbox:{}", outbox.name()),
                format!("{len} entries waiting for redelivery"),
            )
        } else {
            Self::healthy(format!("outbox:{}", outbox.name()))
        };
        check
            .with_metadata("size", len)
            .with_metadata("capacity", outbox.capacity())
    }

    /// Check a circuit breaker: open is unhealthy, half-open is degraded.
    #[must_use]
    pub fn for_breaker(breaker: &CircuitBreaker) -> Self {
        let component = format!("breaker:{}", breaker.name());
        let state = breaker.state();
        let check = match state {
            circuit_breaker::State::Closed => Self::healthy(component),
            circuit_breaker::State::HalfOpen => Self::degraded(component, "recovering"),
            circuit_breaker::State::Open => Self::unhealthy(component, "circuit open"),
        };
        check.with_metadata("state", state.as_str())
    }
}

/// Aggregated health report
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// Overall status (worst of all checks)
    pub status: HealthStatus,

    /// Individual component checks
    pub checks: Vec<HealthCheck>,

    /// When the report was generated
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl HealthReport {
    /// Build a report from individual checks
    #[must_use]
    pub fn new(checks: Vec<HealthCheck>) -> Self {
        let status = checks
            .iter()
            .map(|c| c.status)
            .fold(HealthStatus::Healthy, HealthStatus::worst);

        Self {
            status,
            checks,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Check if every component is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Find the check for a component
    #[must_use]
    pub fn check(&self, component: &str) -> Option<&HealthCheck> {
        self.checks.iter().find(|c| c.component == component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_takes_the_worst_status() {
        let report = HealthReport::new(vec![
            HealthCheck::healthy("stock_store"),
            HealthCheck::degraded("outbox:sync", "3 entries"),
        ]);
        assert_eq!(report.status, HealthStatus::Degraded);

        let report = HealthReport::new(vec![
            HealthCheck::degraded("a", "slow"),
            HealthCheck::unhealthy("b", "down"),
        ]);
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(HealthReport::new(Vec::new()).is_healthy());
    }

    #[test]
    fn outbox_check_degrades_at_threshold() {
        let outbox = Outbox::new("sync", 10);
        assert!(HealthCheck::for_outbox(&outbox, 2).status.is_healthy());
        outbox.park(1, "down", chrono::Utc::now());
        outbox.park(2, "down", chrono::Utc::now());
        let check = HealthCheck::for_outbox(&outbox, 2);
        assert_eq!(check.status, HealthStatus::Degraded);
        assert_eq!(check.component, "outbox:sync");
    }

    #[test]
    fn open_breaker_is_unhealthy() {
        let breaker = CircuitBreaker::new("sync.publish", CircuitBreakerConfig::default());
        assert!(HealthCheck::for_breaker(&breaker).status.is_healthy());
    }
}
