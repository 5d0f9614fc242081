//! Error taxonomy for drop operations.
//!
//! Ledger, reservation and queue failures are returned synchronously to the
//! caller. Only [`DropError::SyncUnavailable`] is swallowed, at the publish
//! boundary of the sync fabric, because clients reconcile from the snapshot.

use crate::store::StoreError;
use crate::types::{DropId, ProductId, ReservationId};
use thiserror::Error;

/// Convenience alias for results of drop operations.
pub type Result<T> = std::result::Result<T, DropError>;

/// Errors returned by the ledger, reservation manager and admission controller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DropError {
    /// Unknown product, reservation, drop or order
    #[error("{entity} not found: {id}")]
    NotFound {
        /// Kind of entity that was looked up
        entity: &'static str,
        /// The identifier that was not found
        id: String,
    },

    /// Requested quantity exceeds what is free at commit time
    #[error("Insufficient stock for product {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        /// Product that was short
        product_id: ProductId,
        /// Units requested by the operation
        requested: u32,
        /// Units free when the operation was validated
        available: u32,
    },

    /// Operation attempted on a reservation or queue entry in the wrong state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Confirm attempted after the reservation window elapsed
    #[error("Reservation {0} has expired")]
    Expired(ReservationId),

    /// Cancel attempted on a sold reservation
    #[error("Reservation {0} is confirmed and cannot be cancelled")]
    CannotCancelConfirmed(ReservationId),

    /// Queue join beyond the configured bound
    ///
    /// Overflow normally goes to the waiting line; this only surfaces if a
    /// store reports an admission that would break the bound.
    #[error("Drop {0} is at capacity")]
    CapacityExceeded(DropId),

    /// A store round-trip exceeded its budget
    #[error("Operation '{operation}' timed out after {budget_ms}ms")]
    Timeout {
        /// Name of the operation that timed out
        operation: &'static str,
        /// The budget that was exceeded
        budget_ms: u64,
    },

    /// Compare-and-swap retries were exhausted under contention
    #[error("Concurrent modification of {0} could not be resolved")]
    Conflict(String),

    /// Publishing to the sync fabric failed
    #[error("Sync fabric unavailable: {0}")]
    SyncUnavailable(String),

    /// Request shape is invalid (zero quantity, oversized hold, ...)
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Underlying store failure
    #[error("Store error: {0}")]
    Store(String),

    /// A collaborator (catalog, order service) failed
    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

impl DropError {
    /// Shorthand for a [`DropError::NotFound`].
    #[must_use]
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller may safely retry the operation with backoff.
    ///
    /// `create` is safe to retry after a timeout only when the caller reuses
    /// the same reservation id.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout { .. } | Self::Conflict(_) | Self::Store(_) | Self::SyncUnavailable(_)
        )
    }

    /// Whether this is an expected, user-facing outcome rather than a fault.
    #[must_use]
    pub const fn is_expected(&self) -> bool {
        matches!(
            self,
            Self::InsufficientStock { .. } | Self::Expired(_) | Self::CapacityExceeded(_)
        )
    }
}

impl From<StoreError> for DropError {
    fn from(err: StoreError) -> Self {
        Self::Store(err.to_string())
    }
}
