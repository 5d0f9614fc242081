//! Payment settlement: reacts to the payment collaborator's two signals.
//!
//! Settlement never initiates payment. A settled order confirms every
//! reservation attached to it at checkout; a failed one cancels them.

use crate::reservation::ReservationManager;
use flashdrop_core::DropError;
use flashdrop_core::reservation::{Reservation, ReservationStatus};
use flashdrop_core::types::{OrderId, ReservationId};

/// Per-reservation result of a settlement signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementOutcome {
    /// Reservation the signal applied to
    pub reservation_id: ReservationId,
    /// Reservation after the signal, or why it could not be applied
    pub result: Result<Reservation, DropError>,
}

impl SettlementOutcome {
    /// Whether the signal took effect (or had already).
    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Payment settlement service.
#[derive(Clone)]
pub struct PaymentSettlement {
    reservations: ReservationManager,
}

impl PaymentSettlement {
    /// Create the settlement service.
    #[must_use]
    pub const fn new(reservations: ReservationManager) -> Self {
        Self { reservations }
    }

    /// Confirm every reservation of a paid order.
    ///
    /// Redelivered signals are harmless: reservations already confirmed for
    /// this order are reported as successes.
    ///
    /// # Errors
    ///
    /// [`DropError::NotFound`] if no reservation is attached to the order.
    pub async fn payment_settled(&self, order_id: &OrderId) -> Result<Vec<SettlementOutcome>, DropError> {
        let attached = self.attached(order_id).await?;
        let mut outcomes = Vec::with_capacity(attached.len());
        for reservation in attached {
            let result = match reservation.status {
                ReservationStatus::Confirmed => Ok(reservation.clone()),
                _ => self.reservations.confirm(reservation.id, order_id.clone()).await,
            };
            if let Err(e) = &result {
                tracing::warn!(
                    order_id = %order_id,
                    reservation_id = %reservation.id,
                    error = %e,
                    "Paid order could not confirm reservation"
                );
            }
            outcomes.push(SettlementOutcome {
                reservation_id: reservation.id,
                result,
            });
        }
        tracing::info!(
            order_id = %order_id,
            confirmed = outcomes.iter().filter(|o| o.is_ok()).count(),
            failed = outcomes.iter().filter(|o| !o.is_ok()).count(),
            "Payment settled"
        );
        Ok(outcomes)
    }

    /// Release every reservation of an order whose payment failed.
    ///
    /// # Errors
    ///
    /// [`DropError::NotFound`] if no reservation is attached to the order.
    pub async fn payment_failed(&self, order_id: &OrderId) -> Result<Vec<SettlementOutcome>, DropError> {
        let attached = self.attached(order_id).await?;
        let mut outcomes = Vec::with_capacity(attached.len());
        for reservation in attached {
            let result = self.reservations.cancel(reservation.id).await;
            if let Err(e) = &result {
                tracing::warn!(
                    order_id = %order_id,
                    reservation_id = %reservation.id,
                    error = %e,
                    "Failed payment could not release reservation"
                );
            }
            outcomes.push(SettlementOutcome {
                reservation_id: reservation.id,
                result,
            });
        }
        tracing::info!(order_id = %order_id, reservations = outcomes.len(), "Payment failed, holds released");
        Ok(outcomes)
    }

    async fn attached(&self, order_id: &OrderId) -> Result<Vec<Reservation>, DropError> {
        let attached = self.reservations.list_by_order(order_id).await?;
        if attached.is_empty() {
            return Err(DropError::not_found("order", order_id));
        }
        Ok(attached)
    }
}
