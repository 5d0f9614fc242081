//! Prometheus metrics for the shared infrastructure.
//!
//! Business metrics (reservations, stock, queues) are described by the drop
//! service itself; this module covers the plumbing every service shares:
//! stores, the sync bus, circuit breakers, retries and the outbox.
//!
//! # Example
//!
//! ```rust,no_run
//! use flashdrop_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://localhost:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, gauge, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build the exporter
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
    /// Failed to install the global recorder
    #[error("Failed to install metrics recorder: {0}")]
    Install(String),
}

/// Prometheus scrape endpoint.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a server that will listen on `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Describe the infrastructure metrics, install the global recorder and
    /// start the HTTP listener on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`MetricsError`] if the exporter cannot be built or another
    /// recorder is already installed.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        describe_infrastructure_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;

        let handle = recorder.handle();
        metrics::set_global_recorder(recorder).map_err(|e| MetricsError::Install(e.to_string()))?;

        tokio::spawn(async move {
            // The exporter's error type implements neither Display nor Debug.
            if exporter.await.is_err() {
                tracing::error!("Metrics exporter stopped with an error");
            }
        });

        tracing::info!(addr = %self.addr, "Metrics available at http://{}/metrics", self.addr);
        self.handle = Some(handle);
        Ok(())
    }

    /// Render the current metrics in Prometheus text format.
    ///
    /// Returns `None` until [`MetricsServer::start`] succeeded.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

/// Register descriptions for every infrastructure metric.
pub fn describe_infrastructure_metrics() {
    describe_histogram!(
        "flashdrop_store_operation_duration_seconds",
        "Store round-trip latency by store and operation"
    );
    describe_counter!(
        "flashdrop_store_errors_total",
        "Store operations that failed, by store and operation"
    );
    describe_counter!(
        "flashdrop_store_cas_conflicts_total",
        "Compare-and-swap writes that lost to a concurrent writer"
    );

    describe_counter!("flashdrop_sync_published_total", "Sync events published");
    describe_counter!("flashdrop_sync_publish_errors_total", "Sync publishes that failed");
    describe_counter!("flashdrop_sync_received_total", "Sync events received by subscribers");
    describe_counter!(
        "flashdrop_sync_stale_dropped_total",
        "Sync events discarded as older than already-applied state"
    );
    describe_histogram!("flashdrop_sync_publish_duration_seconds", "Sync publish latency");

    describe_gauge!(
        "flashdrop_circuit_breaker_state",
        "Circuit breaker state (0=closed, 1=half-open, 2=open)"
    );
    describe_counter!(
        "flashdrop_circuit_breaker_rejections_total",
        "Calls rejected while a circuit was open"
    );

    describe_counter!("flashdrop_retry_attempts_total", "Retries scheduled");
    describe_counter!(
        "flashdrop_retry_recovered_total",
        "Operations that succeeded after at least one retry"
    );
    describe_counter!("flashdrop_retry_exhausted_total", "Operations that ran out of retries");

    describe_gauge!("flashdrop_outbox_size", "Events parked in the outbox");
    describe_counter!("flashdrop_outbox_parked_total", "Events parked in the outbox");
    describe_counter!(
        "flashdrop_outbox_dropped_total",
        "Parked events dropped because the outbox was full"
    );
}

/// Store round-trip recorder.
pub struct StoreMetrics;

impl StoreMetrics {
    /// Record a completed store call.
    pub fn record_operation(store: &'static str, operation: &'static str, duration: Duration) {
        histogram!(
            "flashdrop_store_operation_duration_seconds",
            "store" => store,
            "operation" => operation
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed store call.
    pub fn record_error(store: &'static str, operation: &'static str) {
        counter!("flashdrop_store_errors_total", "store" => store, "operation" => operation)
            .increment(1);
    }

    /// Record a lost compare-and-swap.
    pub fn record_cas_conflict(store: &'static str) {
        counter!("flashdrop_store_cas_conflicts_total", "store" => store).increment(1);
    }
}

/// Sync bus recorder.
pub struct SyncBusMetrics;

impl SyncBusMetrics {
    /// Record a successful publish.
    pub fn record_publish(kind: &'static str, duration: Duration) {
        counter!("flashdrop_sync_published_total", "kind" => kind).increment(1);
        histogram!("flashdrop_sync_publish_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a failed publish.
    pub fn record_publish_error(kind: &'static str) {
        counter!("flashdrop_sync_publish_errors_total", "kind" => kind).increment(1);
    }

    /// Record a received event.
    pub fn record_received(kind: &'static str) {
        counter!("flashdrop_sync_received_total", "kind" => kind).increment(1);
    }

    /// Record a discarded out-of-order or duplicate event.
    pub fn record_stale() {
        counter!("flashdrop_sync_stale_dropped_total").increment(1);
    }
}

/// Circuit breaker recorder.
pub struct CircuitBreakerMetrics;

impl CircuitBreakerMetrics {
    /// Record the state of a breaker (0 = closed, 1 = half-open, 2 = open).
    pub fn record_state(breaker: &'static str, state: f64) {
        gauge!("flashdrop_circuit_breaker_state", "breaker" => breaker).set(state);
    }

    /// Record a rejected call.
    pub fn record_rejection(breaker: &'static str) {
        counter!("flashdrop_circuit_breaker_rejections_total", "breaker" => breaker).increment(1);
    }
}

/// Retry recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a scheduled retry.
    pub fn record_attempt(operation: &'static str) {
        counter!("flashdrop_retry_attempts_total", "operation" => operation).increment(1);
    }

    /// Record an operation that recovered after `attempts` retries.
    pub fn record_success_after_retry(operation: &'static str, attempts: usize) {
        tracing::trace!(operation, attempts, "Recovered after retry");
        counter!("flashdrop_retry_recovered_total", "operation" => operation).increment(1);
    }

    /// Record an operation that ran out of retries.
    pub fn record_exhausted(operation: &'static str) {
        counter!("flashdrop_retry_exhausted_total", "operation" => operation).increment(1);
    }
}

/// Outbox recorder.
pub struct OutboxMetrics;

impl OutboxMetrics {
    /// Record the current outbox size.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_size(name: &'static str, size: usize) {
        gauge!("flashdrop_outbox_size", "outbox" => name).set(size as f64);
    }

    /// Record a parked event.
    pub fn record_parked(name: &'static str) {
        counter!("flashdrop_outbox_parked_total", "outbox" => name).increment(1);
    }

    /// Record an event dropped on overflow.
    pub fn record_dropped(name: &'static str) {
        counter!("flashdrop_outbox_dropped_total", "outbox" => name).increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn server_renders_nothing_before_start() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    #[tokio::test]
    async fn started_server_serves_recorded_metrics() {
        let mut server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        server.start().unwrap();
        tokio::task::yield_now().await;

        StoreMetrics::record_cas_conflict("stock");
        let rendered = server.render().unwrap();
        assert!(rendered.contains("flashdrop_store_cas_conflicts_total"));
    }

    #[test]
    fn recorders_are_noops_without_an_installed_recorder() {
        describe_infrastructure_metrics();
        StoreMetrics::record_operation("stock", "get", Duration::from_millis(2));
        StoreMetrics::record_cas_conflict("stock");
        SyncBusMetrics::record_publish("stock-update", Duration::from_millis(1));
        OutboxMetrics::record_size("sync", 3);
    }
}
