//! Stock records and the single ledger transition.
//!
//! A [`StockRecord`] owns the `(quantity, reserved)` pair for one product.
//! `available = quantity - reserved` is always computed, never written.
//!
//! # Invariant
//!
//! ```text
//! 0 <= reserved <= quantity      (for every record, in every reachable state)
//! available = quantity - reserved
//! ```
//!
//! [`StockRecord::apply_delta`] is the only way to produce a new record from an
//! old one. Stores persist the result with a compare-and-swap on
//! [`StockRecord::revision`], so two writers can never both apply a delta to
//! the same stale `reserved` value.

use crate::error::DropError;
use crate::types::{DropId, ProductId, SellerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Data Structures
// ============================================================================

/// Stock accounting for one product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRecord {
    /// Product identity (immutable)
    pub product_id: ProductId,
    /// Seller owning the product
    pub seller_id: SellerId,
    /// Drop the product is sold in (selects the sync channel)
    pub drop_id: DropId,
    /// Total units on sale; only reduced by a confirmed sale or an admin correction
    pub quantity: u32,
    /// Units currently held by active reservations
    pub reserved: u32,
    /// Advisory threshold for the low-stock signal
    pub low_stock_threshold: u32,
    /// Whether the low-stock signal fired for the current crossing
    pub low_stock_alert_sent: bool,
    /// Incremented by one on every successful write
    pub revision: u64,
    /// Time of the last successful write
    pub updated_at: DateTime<Utc>,
}

/// Computed availability projection. Never persisted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StockStatus {
    /// Nothing left to reserve
    OutOfStock,
    /// At or below the low-stock threshold
    LowStock,
    /// Comfortably available
    InStock,
}

impl StockStatus {
    /// Stable string form used in logs and metrics labels.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::OutOfStock => "out_of_stock",
            Self::LowStock => "low_stock",
            Self::InStock => "in_stock",
        }
    }
}

/// Result of a write crossing the low-stock boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThresholdCrossing {
    /// `available` dropped to or below the threshold; the alert fires once
    EnteredLowStock,
    /// `available` rose back above the threshold; the alert is re-armed
    RecoveredAboveThreshold,
}

/// A requested change to a stock record.
///
/// Reservation paths only touch `reserved_delta` (and `quantity_delta` for a
/// sale). Admin corrections set `expected_quantity` so they can be retried as
/// a compare-and-swap on the quantity they were computed from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StockDelta {
    /// Change applied to `reserved`
    pub reserved_delta: i64,
    /// Change applied to `quantity`
    pub quantity_delta: i64,
    /// Reject with `Conflict` unless `quantity` still equals this value
    pub expected_quantity: Option<u32>,
    /// Replace the low-stock threshold
    pub low_stock_threshold: Option<u32>,
}

impl StockDelta {
    /// Hold `units` for a new reservation.
    #[must_use]
    pub fn reserve(units: u32) -> Self {
        Self {
            reserved_delta: i64::from(units),
            ..Self::default()
        }
    }

    /// Return a hold of `units` to `available`.
    #[must_use]
    pub fn release(units: u32) -> Self {
        Self {
            reserved_delta: -i64::from(units),
            ..Self::default()
        }
    }

    /// Convert a hold of `units` into a sale.
    #[must_use]
    pub fn sell(units: u32) -> Self {
        Self {
            reserved_delta: -i64::from(units),
            quantity_delta: -i64::from(units),
            ..Self::default()
        }
    }

    /// Admin correction from `current` to `target` units.
    #[must_use]
    pub fn correct_quantity(current: u32, target: u32) -> Self {
        Self {
            quantity_delta: i64::from(target) - i64::from(current),
            expected_quantity: Some(current),
            ..Self::default()
        }
    }

    /// Also replace the low-stock threshold.
    #[must_use]
    pub const fn with_threshold(mut self, threshold: u32) -> Self {
        self.low_stock_threshold = Some(threshold);
        self
    }

    /// Whether the delta changes nothing.
    #[must_use]
    pub const fn is_noop(&self) -> bool {
        self.reserved_delta == 0 && self.quantity_delta == 0 && self.low_stock_threshold.is_none()
    }
}

// ============================================================================
// Transition
// ============================================================================

impl StockRecord {
    /// Create a fresh record with nothing reserved.
    #[must_use]
    pub const fn new(
        product_id: ProductId,
        seller_id: SellerId,
        drop_id: DropId,
        quantity: u32,
        low_stock_threshold: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            product_id,
            seller_id,
            drop_id,
            quantity,
            reserved: 0,
            low_stock_threshold,
            low_stock_alert_sent: false,
            revision: 0,
            updated_at: now,
        }
    }

    /// Units free to reserve.
    #[must_use]
    pub const fn available(&self) -> u32 {
        self.quantity.saturating_sub(self.reserved)
    }

    /// Computed status projection.
    #[must_use]
    pub const fn status(&self) -> StockStatus {
        let available = self.available();
        if available == 0 {
            StockStatus::OutOfStock
        } else if available <= self.low_stock_threshold {
            StockStatus::LowStock
        } else {
            StockStatus::InStock
        }
    }

    /// Whether `available` is at or below the threshold.
    #[must_use]
    pub const fn is_low(&self) -> bool {
        self.available() <= self.low_stock_threshold
    }

    /// Whether `0 <= reserved <= quantity` holds.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.reserved <= self.quantity
    }

    /// Apply a delta, returning the next record and any threshold crossing.
    ///
    /// The returned record has `revision + 1` and `updated_at = now`. `self`
    /// is untouched, so a caller that loses the compare-and-swap simply
    /// reloads and calls this again.
    ///
    /// # Errors
    ///
    /// - [`DropError::InsufficientStock`] if the result would have `reserved > quantity`
    /// - [`DropError::Conflict`] if `expected_quantity` no longer matches
    /// - [`DropError::InvalidState`] if `reserved` or `quantity` would go negative
    ///   (a release larger than the outstanding hold)
    /// - [`DropError::InvalidRequest`] if a value would overflow
    pub fn apply_delta(
        &self,
        delta: &StockDelta,
        now: DateTime<Utc>,
    ) -> Result<(Self, Option<ThresholdCrossing>), DropError> {
        if let Some(expected) = delta.expected_quantity {
            if expected != self.quantity {
                return Err(DropError::Conflict(format!(
                    "product {} quantity changed from {expected} to {}",
                    self.product_id, self.quantity
                )));
            }
        }

        let quantity = i64::from(self.quantity) + delta.quantity_delta;
        let reserved = i64::from(self.reserved) + delta.reserved_delta;

        if reserved < 0 {
            return Err(DropError::InvalidState(format!(
                "release of {} exceeds {} reserved units of product {}",
                -delta.reserved_delta, self.reserved, self.product_id
            )));
        }
        if quantity < 0 {
            return Err(DropError::InvalidState(format!(
                "quantity of product {} cannot drop below zero",
                self.product_id
            )));
        }
        if reserved > quantity {
            let requested = if delta.reserved_delta > 0 {
                delta.reserved_delta
            } else {
                reserved
            };
            return Err(DropError::InsufficientStock {
                product_id: self.product_id.clone(),
                requested: u32::try_from(requested).unwrap_or(u32::MAX),
                available: self.available(),
            });
        }

        let quantity = u32::try_from(quantity).map_err(|_| {
            DropError::InvalidRequest(format!("quantity overflow for product {}", self.product_id))
        })?;
        let reserved = u32::try_from(reserved).map_err(|_| {
            DropError::InvalidRequest(format!("reserved overflow for product {}", self.product_id))
        })?;

        let mut next = Self {
            quantity,
            reserved,
            low_stock_threshold: delta.low_stock_threshold.unwrap_or(self.low_stock_threshold),
            revision: self.revision + 1,
            updated_at: now,
            ..self.clone()
        };

        let crossing = match (next.is_low(), next.low_stock_alert_sent) {
            (true, false) => {
                next.low_stock_alert_sent = true;
                Some(ThresholdCrossing::EnteredLowStock)
            },
            (false, true) => {
                next.low_stock_alert_sent = false;
                Some(ThresholdCrossing::RecoveredAboveThreshold)
            },
            _ => None,
        };

        Ok((next, crossing))
    }
}
