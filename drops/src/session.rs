//! Shopping sessions: the server-side end of a shopping window.
//!
//! A shopper's window ends either explicitly ([`ShoppingSessions::end_session`],
//! e.g. the gateway reporting that the storefront timer ran out or the tab
//! closed) or implicitly when the [`SessionSweeper`] finds they have been
//! admitted for longer than `shopping_window`. Either way their holds go back
//! to stock and their queue slot is freed for the next shopper in line.

use crate::admission::AdmissionController;
use crate::metrics;
use crate::reservation::ReservationManager;
use flashdrop_core::DropError;
use flashdrop_core::queue::LeaveOutcome;
use flashdrop_core::reservation::Reservation;
use flashdrop_core::types::{DropId, SessionId, UserId};
use std::time::Duration;
use tokio::sync::broadcast;

/// Result of [`ShoppingSessions::end_session`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionEnd {
    /// Reservations released
    pub cancelled: Vec<Reservation>,
    /// Why the session's holds could not be listed, if they could not;
    /// they are then left to their own TTL
    pub release_error: Option<DropError>,
    /// Queue change caused by leaving
    pub left: LeaveOutcome,
}

/// Ends shopping sessions explicitly.
#[derive(Clone)]
pub struct ShoppingSessions {
    reservations: ReservationManager,
    admission: AdmissionController,
}

impl ShoppingSessions {
    /// Create the session service.
    #[must_use]
    pub const fn new(reservations: ReservationManager, admission: AdmissionController) -> Self {
        Self {
            reservations,
            admission,
        }
    }

    /// Release a session's holds, then give up its queue slot.
    ///
    /// The slot is given up even when the holds cannot be released; that
    /// failure is reported in [`SessionEnd::release_error`].
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the drop has no queue
    /// - store failures while leaving
    pub async fn end_session(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        session_id: &SessionId,
    ) -> Result<SessionEnd, DropError> {
        let (cancelled, release_error) = match self.reservations.cancel_for_session(session_id).await {
            Ok(cancelled) => (cancelled, None),
            Err(e) => {
                tracing::warn!(
                    drop_id = %drop_id,
                    session_id = %session_id,
                    error = %e,
                    "Session holds not released, leaving them to expire"
                );
                (Vec::new(), Some(e))
            }
        };
        let left = self.admission.leave(drop_id, user_id).await?;
        tracing::info!(
            drop_id = %drop_id,
            user_id = %user_id,
            session_id = %session_id,
            cancelled = cancelled.len(),
            promoted = left.promoted.len(),
            "Shopping session ended"
        );
        Ok(SessionEnd {
            cancelled,
            release_error,
            left,
        })
    }
}

/// Periodic end of sessions whose shopping window elapsed.
#[derive(Clone)]
pub struct SessionSweeper {
    sessions: ShoppingSessions,
    interval: Duration,
}

impl SessionSweeper {
    /// Create a sweeper running every `interval`.
    #[must_use]
    pub const fn new(sessions: ShoppingSessions, interval: Duration) -> Self {
        Self { sessions, interval }
    }

    /// End every overstayed session of every drop, releasing its holds and
    /// its queue slot. Returns how many shoppers were evicted.
    ///
    /// # Errors
    ///
    /// Fails only if the drop list cannot be read; a failing drop or shopper
    /// is logged and skipped.
    pub async fn sweep_once(&self) -> Result<usize, DropError> {
        let admission = &self.sessions.admission;
        let mut evicted = 0;
        for drop_id in admission.drops().await? {
            let overstayed = match admission.overstayed(&drop_id).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(drop_id = %drop_id, error = %e, "Session sweep failed for drop");
                    continue;
                }
            };
            let mut ended = 0;
            for entry in overstayed {
                match self.sessions.end_session(&drop_id, &entry.user_id, &entry.session_id).await {
                    Ok(end) if end.left.removed_from.is_some() => ended += 1,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(
                        drop_id = %drop_id,
                        user_id = %entry.user_id,
                        error = %e,
                        "Overstayed session not ended"
                    ),
                }
            }
            if ended > 0 {
                metrics::record_queue_evictions(ended);
                tracing::info!(drop_id = %drop_id, evicted = ended, "Shopping windows elapsed");
            }
            evicted += ended;
        }
        Ok(evicted)
    }

    /// Sweep every `interval` until shutdown.
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.interval.as_secs(), "Session sweeper started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "Session sweep failed");
                    }
                }
                _ = shutdown.recv() => {
                    tracing::info!("Session sweeper stopped");
                    return;
                }
            }
        }
    }
}
