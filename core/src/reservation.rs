//! Reservation records and lifecycle.
//!
//! ```text
//!            ┌──────────► confirmed   (sale: quantity -= q, reserved -= q)
//!            │
//!  active ───┼──────────► cancelled   (release: reserved -= q)
//!            │
//!            └──────────► expired     (release: reserved -= q, reaper or late confirm)
//! ```
//!
//! Terminal states are final. Every transition out of `active` is a
//! conditional write in the store, so whichever of confirm / cancel / expire
//! wins the race is the only one that touches stock.
//!
//! The same write marks the reservation `stock_pending`. The mark is cleared
//! once its stock effect has been applied, so a transition whose effect
//! failed stays discoverable and is settled later by the reaper.

use crate::error::DropError;
use crate::types::{OrderId, ProductId, ReservationId, SessionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reservation status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationStatus {
    /// Holding stock, awaiting checkout
    Active,
    /// Converted into a sale
    Confirmed,
    /// Released by the shopper or a failed payment
    Cancelled,
    /// Released because the hold timed out
    Expired,
}

impl ReservationStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Confirmed => "confirmed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Parse status from its storage representation.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::InvalidState`] if the string is not a known status.
    pub fn parse(s: &str) -> Result<Self, DropError> {
        match s {
            "active" => Ok(Self::Active),
            "confirmed" => Ok(Self::Confirmed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(DropError::InvalidState(format!(
                "Invalid reservation status: {s}"
            ))),
        }
    }

    /// Whether no further transition is possible.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        !matches!(self, Self::Active)
    }

    /// Whether the state releases its hold back to `available`.
    #[must_use]
    pub const fn releases_stock(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A time-boxed hold on stock for one shopping session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reservation {
    /// Reservation identity
    pub id: ReservationId,
    /// Product being held
    pub product_id: ProductId,
    /// Units held (at least one)
    pub quantity: u32,
    /// Shopper's cart/session
    pub session_id: SessionId,
    /// Hold deadline
    pub expires_at: DateTime<Utc>,
    /// Lifecycle state
    pub status: ReservationStatus,
    /// Order the hold belongs to (attached at checkout, always set once confirmed)
    pub order_id: Option<OrderId>,
    /// When the hold was taken
    pub created_at: DateTime<Utc>,
    /// Last status change or settlement claim
    pub updated_at: DateTime<Utc>,
    /// Terminal, but its sale or release has not reached the ledger yet
    #[serde(default)]
    pub stock_pending: bool,
}

impl Reservation {
    /// Create a new active reservation expiring at `now + ttl`.
    #[must_use]
    pub fn new(
        id: ReservationId,
        product_id: ProductId,
        quantity: u32,
        session_id: SessionId,
        ttl: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            product_id,
            quantity,
            session_id,
            expires_at: now + ttl,
            status: ReservationStatus::Active,
            order_id: None,
            created_at: now,
            updated_at: now,
            stock_pending: false,
        }
    }

    /// Whether the hold deadline has passed at `now`.
    ///
    /// This is a read-only check. Expiry only takes effect through a confirm
    /// attempt or the reaper.
    #[must_use]
    pub fn is_past_deadline(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Whether the record still holds stock.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, ReservationStatus::Active)
    }

    /// Whether the record left `active` but its stock effect is still owed.
    #[must_use]
    pub const fn is_unsettled(&self) -> bool {
        self.status.is_terminal() && self.stock_pending
    }

    /// Seconds left before the deadline (zero once passed).
    #[must_use]
    pub fn remaining_seconds(&self, now: DateTime<Utc>) -> i64 {
        (self.expires_at - now).num_seconds().max(0)
    }
}

/// Read-only projection returned by `reservation.status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationView {
    /// The stored reservation, unmodified
    pub reservation: Reservation,
    /// Whether the deadline has passed although the record is still `active`
    pub past_deadline: bool,
    /// Seconds left before the deadline
    pub remaining_seconds: i64,
}

impl ReservationView {
    /// Project a reservation at `now` without mutating it.
    #[must_use]
    pub fn at(reservation: Reservation, now: DateTime<Utc>) -> Self {
        let past_deadline = reservation.is_active() && reservation.is_past_deadline(now);
        let remaining_seconds = if reservation.is_active() {
            reservation.remaining_seconds(now)
        } else {
            0
        };
        Self {
            reservation,
            past_deadline,
            remaining_seconds,
        }
    }
}
