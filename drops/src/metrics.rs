//! Business metrics for flash-sale drops.
//!
//! # Exported Metrics
//!
//! ## Counters
//! - `flashdrop_reservations_total{status}` - Reservations by outcome (created, confirmed, cancelled, expired, rejected)
//! - `flashdrop_units_sold_total` - Units converted into sales
//! - `flashdrop_low_stock_alerts_total` - Low-stock signals fired
//! - `flashdrop_queue_joins_total{outcome}` - Joins by outcome (admitted, waiting)
//! - `flashdrop_queue_promotions_total` - Waiting users promoted to active
//! - `flashdrop_queue_evictions_total` - Active users evicted at the end of their shopping window
//! - `flashdrop_reaper_expired_total` - Reservations expired by the reaper
//! - `flashdrop_reaper_failures_total` - Reservations the reaper failed to expire or settle
//! - `flashdrop_reaper_resettled_total` - Stalled stock effects the reaper applied
//!
//! ## Gauges
//! - `flashdrop_stock_available{product}` - Units free to reserve
//! - `flashdrop_queue_active{drop}` / `flashdrop_queue_waiting{drop}` - Queue occupancy
//!
//! ## Histograms
//! - `flashdrop_reservation_hold_seconds{status}` - Time from hold to terminal state
//! - `flashdrop_reaper_sweep_duration_seconds` - Reaper sweep latency
//! - `flashdrop_ledger_cas_attempts` - Compare-and-swap attempts per ledger write

use flashdrop_core::queue::DropQueue;
use flashdrop_core::reservation::ReservationStatus;
use flashdrop_core::stock::StockRecord;
use metrics::{describe_counter, describe_gauge, describe_histogram};
use std::time::Duration;

/// Register descriptions for every business metric.
///
/// Call once at startup, before any metric is recorded.
pub fn register_business_metrics() {
    describe_counter!(
        "flashdrop_reservations_total",
        "Reservations by outcome (created, confirmed, cancelled, expired, rejected)"
    );
    describe_counter!("flashdrop_units_sold_total", "Units converted into sales");
    describe_histogram!(
        "flashdrop_reservation_hold_seconds",
        "Time from hold to terminal state, by terminal status"
    );

    describe_gauge!("flashdrop_stock_available", "Units free to reserve, by product");
    describe_counter!("flashdrop_low_stock_alerts_total", "Low-stock signals fired");
    describe_histogram!(
        "flashdrop_ledger_cas_attempts",
        "Compare-and-swap attempts needed per ledger write"
    );

    describe_counter!("flashdrop_queue_joins_total", "Queue joins by outcome (admitted, waiting)");
    describe_counter!("flashdrop_queue_promotions_total", "Waiting users promoted to active");
    describe_counter!(
        "flashdrop_queue_evictions_total",
        "Active users evicted when their shopping window elapsed"
    );
    describe_gauge!("flashdrop_queue_active", "Active shoppers, by drop");
    describe_gauge!("flashdrop_queue_waiting", "Waiting shoppers, by drop");

    describe_counter!("flashdrop_reaper_expired_total", "Reservations expired by the reaper");
    describe_counter!(
        "flashdrop_reaper_failures_total",
        "Reservations the reaper failed to expire or settle"
    );
    describe_counter!(
        "flashdrop_reaper_resettled_total",
        "Terminal reservations whose stalled stock effect the reaper applied"
    );
    describe_histogram!("flashdrop_reaper_sweep_duration_seconds", "Reaper sweep latency");

    tracing::info!("Business metrics registered");
}

// ============================================================================
// Metric Recording Functions
// ============================================================================

/// Record a new hold.
pub fn record_reservation_created(quantity: u32) {
    metrics::counter!("flashdrop_reservations_total", "status" => "created").increment(1);
    tracing::debug!(quantity, "Recorded reservation_created metric");
}

/// Record a create rejected for lack of stock.
pub fn record_reservation_rejected() {
    metrics::counter!("flashdrop_reservations_total", "status" => "rejected").increment(1);
}

/// Record a terminal transition.
pub fn record_reservation_terminal(status: ReservationStatus, quantity: u32, held_for: Duration) {
    metrics::counter!("flashdrop_reservations_total", "status" => status.as_str()).increment(1);
    metrics::histogram!("flashdrop_reservation_hold_seconds", "status" => status.as_str())
        .record(held_for.as_secs_f64());
    if status == ReservationStatus::Confirmed {
        metrics::counter!("flashdrop_units_sold_total").increment(u64::from(quantity));
    }
}

/// Record the state of a stock record after a write.
pub fn record_stock(record: &StockRecord) {
    metrics::gauge!("flashdrop_stock_available", "product" => record.product_id.to_string())
        .set(f64::from(record.available()));
}

/// Record a low-stock signal.
pub fn record_low_stock_alert() {
    metrics::counter!("flashdrop_low_stock_alerts_total").increment(1);
}

/// Record how many compare-and-swap attempts a ledger write took.
pub fn record_cas_attempts(attempts: u32) {
    metrics::histogram!("flashdrop_ledger_cas_attempts").record(f64::from(attempts));
}

/// Record a join outcome.
pub fn record_queue_join(admitted: bool) {
    let outcome = if admitted { "admitted" } else { "waiting" };
    metrics::counter!("flashdrop_queue_joins_total", "outcome" => outcome).increment(1);
}

/// Record users promoted from waiting to active.
pub fn record_queue_promotions(count: usize) {
    if count > 0 {
        metrics::counter!("flashdrop_queue_promotions_total").increment(count as u64);
    }
}

/// Record users evicted at the end of their window.
pub fn record_queue_evictions(count: usize) {
    if count > 0 {
        metrics::counter!("flashdrop_queue_evictions_total").increment(count as u64);
    }
}

/// Record queue occupancy after a write.
pub fn record_queue(queue: &DropQueue) {
    let drop_id = queue.drop_id.to_string();
    metrics::gauge!("flashdrop_queue_active", "drop" => drop_id.clone())
        .set(f64::from(queue.active_count()));
    metrics::gauge!("flashdrop_queue_waiting", "drop" => drop_id)
        .set(f64::from(queue.waiting_count()));
}

/// Record one reaper sweep.
pub fn record_reaper_sweep(expired: usize, resettled: usize, failed: usize, duration: Duration) {
    metrics::counter!("flashdrop_reaper_expired_total").increment(expired as u64);
    metrics::counter!("flashdrop_reaper_resettled_total").increment(resettled as u64);
    metrics::counter!("flashdrop_reaper_failures_total").increment(failed as u64);
    metrics::histogram!("flashdrop_reaper_sweep_duration_seconds").record(duration.as_secs_f64());
}
