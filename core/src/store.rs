//! Persistence seams for stock, reservations and drop queues.
//!
//! Every write that can race is a compare-and-swap: stock and queue records
//! are swapped on their `revision`, reservations only leave `active` through
//! [`ReservationStore::transition`], which succeeds for exactly one caller.
//!
//! # Implementations
//!
//! - `InMemory*Store` (in `flashdrop-testing`): fast, deterministic testing
//! - `PostgresStore` (in `flashdrop-postgres`): production
//!
//! # Dyn Compatibility
//!
//! The traits return [`StoreFuture`] instead of using `async fn` so services can
//! hold them as `Arc<dyn StockStore>` and friends.

use crate::queue::DropQueue;
use crate::reservation::{Reservation, ReservationStatus};
use crate::stock::StockRecord;
use crate::types::{DropId, OrderId, ProductId, ReservationId, SellerId, SessionId};
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Errors that can occur in a store implementation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// Database or query failure
    #[error("Database error: {0}")]
    Database(String),

    /// A stored record could not be encoded or decoded
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

/// Per-product stock records.
pub trait StockStore: Send + Sync {
    /// Load a record.
    fn get(&self, product_id: &ProductId) -> StoreFuture<'_, Option<StockRecord>>;

    /// Insert `record` unless one already exists; returns whichever record is stored.
    fn insert_if_absent(&self, record: StockRecord) -> StoreFuture<'_, StockRecord>;

    /// Replace the stored record with `next` only if the stored revision is
    /// still `expected_revision`. Returns `false` when another writer won.
    fn compare_and_swap(
        &self,
        expected_revision: u64,
        next: StockRecord,
    ) -> StoreFuture<'_, bool>;

    /// All records owned by a seller, ordered by product id.
    fn list_by_seller(&self, seller_id: &SellerId) -> StoreFuture<'_, Vec<StockRecord>>;

    /// All records sold in a drop, ordered by product id.
    fn list_by_drop(&self, drop_id: &DropId) -> StoreFuture<'_, Vec<StockRecord>>;

    /// Records whose `available` is at or below their threshold, optionally for one seller.
    fn list_low_stock(&self, seller_id: Option<&SellerId>) -> StoreFuture<'_, Vec<StockRecord>>;
}

/// Reservation records.
pub trait ReservationStore: Send + Sync {
    /// Insert a new reservation. Returns `false` if the id already exists.
    fn insert(&self, reservation: Reservation) -> StoreFuture<'_, bool>;

    /// Load a reservation.
    fn get(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>>;

    /// Move an `active` reservation to `to`, optionally stamping `order_id`.
    ///
    /// The same write sets `stock_pending`, cleared by [`ReservationStore::mark_settled`]
    /// once the stock effect is applied.
    ///
    /// Returns the updated record, or `None` if the reservation is missing or
    /// no longer `active`. At most one caller ever gets `Some` for a given id.
    fn transition(
        &self,
        id: ReservationId,
        to: ReservationStatus,
        order_id: Option<OrderId>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Reservation>>;

    /// Attach an order to an `active` reservation. Returns `None` if it is not active.
    fn attach_order(
        &self,
        id: ReservationId,
        order_id: OrderId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Reservation>>;

    /// `active` reservations with `expires_at < now`, oldest deadline first.
    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>>;

    /// `active` reservations for a product.
    fn list_active_by_product(&self, product_id: &ProductId)
    -> StoreFuture<'_, Vec<Reservation>>;

    /// `active` reservations for a session.
    fn list_active_by_session(&self, session_id: &SessionId)
    -> StoreFuture<'_, Vec<Reservation>>;

    /// Reservations of any status attached to an order.
    fn list_by_order(&self, order_id: &OrderId) -> StoreFuture<'_, Vec<Reservation>>;

    /// Terminal reservations still `stock_pending` whose last update is older
    /// than `before`, oldest first.
    fn list_unsettled(&self, before: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>>;

    /// Take over settling a `stock_pending` reservation.
    ///
    /// Succeeds only if `updated_at` still equals `seen`, and moves it to `at`,
    /// so of several replicas re-driving the same reservation exactly one wins.
    fn claim_settlement(
        &self,
        id: ReservationId,
        seen: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool>;

    /// Clear `stock_pending` once the stock effect has been applied.
    ///
    /// Returns `None` if the reservation is missing or was not pending.
    fn mark_settled(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>>;
}

/// Per-drop admission queues.
pub trait QueueStore: Send + Sync {
    /// Load a queue.
    fn load(&self, drop_id: &DropId) -> StoreFuture<'_, Option<DropQueue>>;

    /// Insert `queue` unless one already exists; returns whichever queue is stored.
    fn create(&self, queue: DropQueue) -> StoreFuture<'_, DropQueue>;

    /// Replace the stored queue with `next` only if the stored revision is
    /// still `expected_revision`.
    fn compare_and_swap(&self, expected_revision: u64, next: DropQueue) -> StoreFuture<'_, bool>;

    /// Ids of every configured drop.
    fn list_drops(&self) -> StoreFuture<'_, Vec<DropId>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_render_their_cause() {
        let err = StoreError::Unavailable("connection refused".into());
        assert_eq!(err.to_string(), "Store unavailable: connection refused");
    }
}
