//! Reservation reaper: the enforcement backstop for lazy expiry.
//!
//! Status reads never expire anything, so abandoned holds keep their stock
//! until a confirm attempt or this sweep moves them to `expired`.
//!
//! Each sweep first settles terminal reservations whose stock effect failed
//! earlier, so a ledger outage during cancel, confirm or expiry heals on its own.

use crate::metrics;
use crate::reservation::ReservationManager;
use flashdrop_core::DropError;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;

/// Outcome of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// Expired-but-active reservations found
    pub scanned: usize,
    /// Reservations this sweep moved to `expired`
    pub expired: usize,
    /// Reservations another caller moved out of `active` first
    pub skipped: usize,
    /// Reservations whose expiry or settlement failed; retried next sweep
    pub failed: usize,
    /// Terminal reservations whose stalled stock effect this sweep applied
    pub resettled: usize,
}

/// Periodic sweep over lapsed reservations.
#[derive(Clone)]
pub struct ReservationReaper {
    reservations: ReservationManager,
    interval: Duration,
    batch_size: usize,
}

impl ReservationReaper {
    /// Create a reaper that scans up to `batch_size` reservations every `interval`.
    #[must_use]
    pub const fn new(reservations: ReservationManager, interval: Duration, batch_size: usize) -> Self {
        Self {
            reservations,
            interval,
            batch_size,
        }
    }

    /// Settle one batch of stalled reservations, then expire one batch of
    /// lapsed ones.
    ///
    /// A failure on one reservation is logged and counted; the sweep carries on.
    ///
    /// # Errors
    ///
    /// Fails only if a scan itself fails.
    pub async fn sweep_once(&self) -> Result<ReapReport, DropError> {
        let started = Instant::now();
        let mut report = ReapReport::default();

        for reservation in self.reservations.list_unsettled(self.batch_size).await? {
            match self.reservations.resettle(&reservation).await {
                Ok(true) => report.resettled += 1,
                Ok(false) => {}
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        reservation_id = %reservation.id,
                        product_id = %reservation.product_id,
                        error = %e,
                        "Failed to settle reservation"
                    );
                }
            }
        }

        let lapsed = self.reservations.list_expired(self.batch_size).await?;
        report.scanned = lapsed.len();

        for reservation in &lapsed {
            match self.reservations.expire_reservation(reservation).await {
                Ok(Some(_)) => report.expired += 1,
                Ok(None) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        reservation_id = %reservation.id,
                        product_id = %reservation.product_id,
                        error = %e,
                        "Failed to expire reservation"
                    );
                }
            }
        }

        metrics::record_reaper_sweep(report.expired, report.resettled, report.failed, started.elapsed());
        if report.scanned > 0 || report.resettled > 0 {
            tracing::info!(
                scanned = report.scanned,
                expired = report.expired,
                skipped = report.skipped,
                failed = report.failed,
                resettled = report.resettled,
                "Reaper sweep finished"
            );
        }
        Ok(report)
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            batch_size = self.batch_size,
            "Reservation reaper started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Reaper scan failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Reservation reaper stopped");
                    return;
                }
            }
        }
    }
}
