//! Reservation manager: time-boxed holds against the stock ledger.
//!
//! ```text
//!             ┌──► confirmed   (sale: quantity -= n, reserved -= n)
//!   active ───┼──► cancelled   (release: reserved -= n)
//!             └──► expired     (release: reserved -= n)
//! ```
//!
//! Every exit from `active` is a conditional store write that only one caller
//! can win. The stock effect runs after the transition is won, so a race
//! between confirm, cancel and the reaper produces exactly one terminal state
//! and exactly one stock effect.
//!
//! The winning write also marks the reservation `stock_pending`. If the stock
//! effect then fails, the mark stays and the reaper settles the reservation
//! once `settle_grace` has passed; the hold is never stranded in `reserved`.

use crate::config::ReservationConfig;
use crate::deadline::within;
use crate::ledger::StockLedger;
use crate::metrics;
use flashdrop_core::DropError;
use flashdrop_core::collaborators::OrderService;
use flashdrop_core::environment::Clock;
use flashdrop_core::reservation::{Reservation, ReservationStatus, ReservationView};
use flashdrop_core::stock::{StockDelta, StockRecord};
use flashdrop_core::store::ReservationStore;
use flashdrop_core::types::{OrderId, ProductId, ReservationId, SessionId};
use flashdrop_runtime::{RetryPolicy, retry_with_predicate};
use std::sync::Arc;
use std::time::Duration;

/// Request to hold stock.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateReservation {
    /// Client-chosen id. Reusing it on retry returns the committed hold.
    pub id: Option<ReservationId>,
    /// Product to hold
    pub product_id: ProductId,
    /// Units to hold
    pub quantity: u32,
    /// Shopper's session
    pub session_id: SessionId,
    /// Hold duration, defaults to the configured TTL
    pub ttl: Option<Duration>,
}

impl CreateReservation {
    /// Hold `quantity` units of `product_id` for `session_id`.
    #[must_use]
    pub fn new(product_id: impl Into<ProductId>, quantity: u32, session_id: impl Into<SessionId>) -> Self {
        Self {
            id: None,
            product_id: product_id.into(),
            quantity,
            session_id: session_id.into(),
            ttl: None,
        }
    }

    /// Use a client-supplied id.
    #[must_use]
    pub const fn with_id(mut self, id: ReservationId) -> Self {
        self.id = Some(id);
        self
    }

    /// Override the hold duration.
    #[must_use]
    pub const fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

/// Reservation manager service.
#[derive(Clone)]
pub struct ReservationManager {
    ledger: StockLedger,
    reservations: Arc<dyn ReservationStore>,
    orders: Arc<dyn OrderService>,
    clock: Arc<dyn Clock>,
    config: ReservationConfig,
    retry: RetryPolicy,
}

impl ReservationManager {
    /// Create a manager.
    #[must_use]
    pub fn new(
        ledger: StockLedger,
        reservations: Arc<dyn ReservationStore>,
        orders: Arc<dyn OrderService>,
        clock: Arc<dyn Clock>,
        config: ReservationConfig,
    ) -> Self {
        Self {
            ledger,
            reservations,
            orders,
            clock,
            config,
            retry: RetryPolicy::default(),
        }
    }

    /// Replace the backoff used for stock effects after a won transition.
    #[must_use]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The ledger this manager writes through.
    #[must_use]
    pub const fn ledger(&self) -> &StockLedger {
        &self.ledger
    }

    /// Hold stock (`reservation.create`).
    ///
    /// Availability is checked twice: once against a fresh read so the common
    /// "sold out" case never touches the write path, and again inside the
    /// ledger's compare-and-swap, which is the check that counts.
    ///
    /// # Errors
    ///
    /// - [`DropError::InvalidRequest`] for a zero or oversized quantity, or an id
    ///   already used for a different hold
    /// - [`DropError::InsufficientStock`] if fewer than `quantity` units are available
    /// - [`DropError::NotFound`] if the product is unknown
    /// - [`DropError::Timeout`] / [`DropError::Store`] / [`DropError::Conflict`];
    ///   retry with the same id
    pub async fn create(&self, request: CreateReservation) -> Result<Reservation, DropError> {
        self.validate(&request)?;

        if let Some(id) = request.id {
            if let Some(existing) = self.load(id).await? {
                return Self::same_hold(existing, &request);
            }
        }

        let current = self.ledger.get_or_init(&request.product_id).await?;
        if request.quantity > current.available() {
            metrics::record_reservation_rejected();
            return Err(DropError::InsufficientStock {
                product_id: request.product_id,
                requested: request.quantity,
                available: current.available(),
            });
        }

        if let Err(e) = self
            .ledger
            .apply(&request.product_id, StockDelta::reserve(request.quantity))
            .await
        {
            if matches!(e, DropError::InsufficientStock { .. }) {
                metrics::record_reservation_rejected();
            }
            return Err(e);
        }

        let ttl = request.ttl.unwrap_or(self.config.default_ttl);
        let ttl = chrono::Duration::from_std(ttl)
            .map_err(|_| DropError::InvalidRequest(format!("ttl out of range: {ttl:?}")))?;
        let reservation = Reservation::new(
            request.id.unwrap_or_default(),
            request.product_id.clone(),
            request.quantity,
            request.session_id.clone(),
            ttl,
            self.clock.now(),
        );

        let inserted = within(
            "reservation.insert",
            self.config.store_timeout,
            self.reservations.insert(reservation.clone()),
        )
        .await;

        match inserted {
            Ok(true) => {
                metrics::record_reservation_created(reservation.quantity);
                tracing::info!(
                    reservation_id = %reservation.id,
                    product_id = %reservation.product_id,
                    session_id = %reservation.session_id,
                    quantity = reservation.quantity,
                    expires_at = %reservation.expires_at,
                    "Reservation created"
                );
                Ok(reservation)
            }
            Ok(false) => {
                // A concurrent retry with the same id committed first.
                self.release_hold(&reservation, "duplicate").await;
                let existing = self
                    .load(reservation.id)
                    .await?
                    .ok_or_else(|| DropError::not_found("reservation", reservation.id))?;
                Self::same_hold(existing, &request)
            }
            Err(e) => {
                self.release_hold(&reservation, "insert failed").await;
                Err(e)
            }
        }
    }

    fn validate(&self, request: &CreateReservation) -> Result<(), DropError> {
        if request.quantity == 0 {
            return Err(DropError::InvalidRequest("quantity must be at least 1".into()));
        }
        if request.quantity > self.config.max_quantity_per_reservation {
            return Err(DropError::InvalidRequest(format!(
                "quantity {} exceeds the per-reservation limit of {}",
                request.quantity, self.config.max_quantity_per_reservation
            )));
        }
        Ok(())
    }

    fn same_hold(existing: Reservation, request: &CreateReservation) -> Result<Reservation, DropError> {
        if existing.product_id == request.product_id
            && existing.quantity == request.quantity
            && existing.session_id == request.session_id
        {
            tracing::debug!(reservation_id = %existing.id, "Create retried, returning committed reservation");
            Ok(existing)
        } else {
            Err(DropError::InvalidRequest(format!(
                "reservation id {} is already used for a different hold",
                existing.id
            )))
        }
    }

    /// Undo the hold of a reservation that was never persisted.
    async fn release_hold(&self, reservation: &Reservation, reason: &'static str) {
        if let Err(e) = self
            .stock_effect("reservation.compensate", &reservation.product_id, StockDelta::release(reservation.quantity))
            .await
        {
            tracing::error!(
                reservation_id = %reservation.id,
                product_id = %reservation.product_id,
                quantity = reservation.quantity,
                reason,
                error = %e,
                "Failed to release hold of unpersisted reservation"
            );
        }
    }

    /// Convert a hold into a sale (`reservation.confirm`).
    ///
    /// A confirm past the deadline expires the reservation, releases its hold
    /// and fails with [`DropError::Expired`].
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the reservation does not exist
    /// - [`DropError::InvalidState`] if it is no longer `active`
    /// - [`DropError::Expired`] if its deadline has passed
    /// - ledger failures after the sale was recorded; the reaper applies it later
    pub async fn confirm(&self, id: ReservationId, order_id: OrderId) -> Result<Reservation, DropError> {
        let reservation = self.require(id).await?;
        if !reservation.is_active() {
            return Err(Self::not_active(&reservation));
        }

        let now = self.clock.now();
        if reservation.is_past_deadline(now) {
            if self.expire_reservation(&reservation).await?.is_none() {
                // Someone else moved it out of `active` first.
                let current = self.require(id).await?;
                return Err(Self::not_active(&current));
            }
            return Err(DropError::Expired(id));
        }

        let Some(confirmed) = within(
            "reservation.transition",
            self.config.store_timeout,
            self.reservations
                .transition(id, ReservationStatus::Confirmed, Some(order_id.clone()), now),
        )
        .await?
        else {
            // Lost to a concurrent cancel or expiry.
            let current = self.require(id).await?;
            return Err(Self::not_active(&current));
        };

        self.settle(&confirmed).await?;
        tracing::info!(
            reservation_id = %id,
            order_id = %order_id,
            product_id = %confirmed.product_id,
            quantity = confirmed.quantity,
            "Reservation confirmed"
        );
        Ok(confirmed)
    }

    /// Release a hold (`reservation.cancel`).
    ///
    /// Cancelling an already cancelled or expired reservation succeeds without
    /// touching stock.
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the reservation does not exist
    /// - [`DropError::CannotCancelConfirmed`] if it was sold
    /// - ledger failures after the cancel was recorded; the reaper releases the hold later
    pub async fn cancel(&self, id: ReservationId) -> Result<Reservation, DropError> {
        let reservation = self.require(id).await?;
        match reservation.status {
            ReservationStatus::Confirmed => return Err(DropError::CannotCancelConfirmed(id)),
            ReservationStatus::Cancelled | ReservationStatus::Expired => return Ok(reservation),
            ReservationStatus::Active => {}
        }

        let cancelled = within(
            "reservation.transition",
            self.config.store_timeout,
            self.reservations
                .transition(id, ReservationStatus::Cancelled, None, self.clock.now()),
        )
        .await?;

        let Some(cancelled) = cancelled else {
            let current = self.require(id).await?;
            return if current.status == ReservationStatus::Confirmed {
                Err(DropError::CannotCancelConfirmed(id))
            } else {
                Ok(current)
            };
        };

        self.settle(&cancelled).await?;
        tracing::info!(
            reservation_id = %id,
            product_id = %cancelled.product_id,
            quantity = cancelled.quantity,
            "Reservation cancelled"
        );
        Ok(cancelled)
    }

    /// Read-only projection (`reservation.status`). Never expires anything.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::NotFound`] if the reservation does not exist.
    pub async fn status(&self, id: ReservationId) -> Result<ReservationView, DropError> {
        let reservation = self.require(id).await?;
        Ok(ReservationView::at(reservation, self.clock.now()))
    }

    /// Expire a reservation if it is still active and past its deadline.
    ///
    /// Returns `None` when there was nothing to do.
    ///
    /// # Errors
    ///
    /// Store or ledger failures.
    pub async fn expire(&self, id: ReservationId) -> Result<Option<Reservation>, DropError> {
        let reservation = self.require(id).await?;
        if !reservation.is_active() || !reservation.is_past_deadline(self.clock.now()) {
            return Ok(None);
        }
        self.expire_reservation(&reservation).await
    }

    /// Move `reservation` to `expired` and release its hold.
    ///
    /// Returns `None` if another caller already moved it out of `active`.
    ///
    /// # Errors
    ///
    /// Store or ledger failures.
    pub async fn expire_reservation(
        &self,
        reservation: &Reservation,
    ) -> Result<Option<Reservation>, DropError> {
        let expired = within(
            "reservation.transition",
            self.config.store_timeout,
            self.reservations
                .transition(reservation.id, ReservationStatus::Expired, None, self.clock.now()),
        )
        .await?;

        let Some(expired) = expired else {
            tracing::debug!(reservation_id = %reservation.id, "Reservation already left active, nothing to expire");
            return Ok(None);
        };

        self.settle(&expired).await?;
        tracing::info!(
            reservation_id = %expired.id,
            product_id = %expired.product_id,
            quantity = expired.quantity,
            expires_at = %expired.expires_at,
            "Reservation expired"
        );
        Ok(Some(expired))
    }

    /// Attach `order_id` to every active reservation of a session.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn begin_checkout(
        &self,
        session_id: &SessionId,
        order_id: &OrderId,
    ) -> Result<Vec<Reservation>, DropError> {
        let active = self.active_for_session(session_id).await?;
        let mut attached = Vec::with_capacity(active.len());
        for reservation in active {
            let updated = within(
                "reservation.attach_order",
                self.config.store_timeout,
                self.reservations
                    .attach_order(reservation.id, order_id.clone(), self.clock.now()),
            )
            .await?;
            if let Some(updated) = updated {
                attached.push(updated);
            }
        }
        tracing::info!(
            session_id = %session_id,
            order_id = %order_id,
            reservations = attached.len(),
            "Checkout started"
        );
        Ok(attached)
    }

    /// Cancel every active reservation of a session.
    ///
    /// Keeps going past individual failures and returns the reservations it
    /// did cancel.
    ///
    /// # Errors
    ///
    /// Fails only if the session's reservations cannot be listed.
    pub async fn cancel_for_session(&self, session_id: &SessionId) -> Result<Vec<Reservation>, DropError> {
        let active = self.active_for_session(session_id).await?;
        let mut cancelled = Vec::with_capacity(active.len());
        for reservation in active {
            match self.cancel(reservation.id).await {
                Ok(r) if r.status == ReservationStatus::Cancelled => cancelled.push(r),
                Ok(_) => {}
                Err(e) => tracing::warn!(
                    reservation_id = %reservation.id,
                    session_id = %session_id,
                    error = %e,
                    "Failed to cancel session reservation"
                ),
            }
        }
        Ok(cancelled)
    }

    /// Reservations of any status attached to an order.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_by_order(&self, order_id: &OrderId) -> Result<Vec<Reservation>, DropError> {
        within(
            "reservation.list_by_order",
            self.config.store_timeout,
            self.reservations.list_by_order(order_id),
        )
        .await
    }

    /// Terminal reservations whose stock effect has been owed for longer than
    /// `settle_grace`, oldest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_unsettled(&self, limit: usize) -> Result<Vec<Reservation>, DropError> {
        let grace = chrono::Duration::from_std(self.config.settle_grace)
            .map_err(|_| DropError::InvalidRequest("settle grace out of range".into()))?;
        within(
            "reservation.list_unsettled",
            self.config.store_timeout,
            self.reservations.list_unsettled(self.clock.now() - grace, limit),
        )
        .await
    }

    /// Apply the owed stock effect of a reservation returned by
    /// [`ReservationManager::list_unsettled`].
    ///
    /// Returns `false` if another caller took the reservation over first.
    ///
    /// # Errors
    ///
    /// Store or ledger failures; the reservation stays pending for a later sweep.
    pub async fn resettle(&self, reservation: &Reservation) -> Result<bool, DropError> {
        let claimed = within(
            "reservation.claim_settlement",
            self.config.store_timeout,
            self.reservations
                .claim_settlement(reservation.id, reservation.updated_at, self.clock.now()),
        )
        .await?;
        if !claimed {
            tracing::debug!(reservation_id = %reservation.id, "Settlement already taken over");
            return Ok(false);
        }

        self.settle(reservation).await?;
        tracing::info!(
            reservation_id = %reservation.id,
            status = %reservation.status,
            product_id = %reservation.product_id,
            quantity = reservation.quantity,
            "Stalled reservation settled"
        );
        Ok(true)
    }

    /// Expired-but-active reservations, oldest deadline first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_expired(&self, limit: usize) -> Result<Vec<Reservation>, DropError> {
        within(
            "reservation.list_expired",
            self.config.store_timeout,
            self.reservations.list_expired(self.clock.now(), limit),
        )
        .await
    }

    async fn active_for_session(&self, session_id: &SessionId) -> Result<Vec<Reservation>, DropError> {
        within(
            "reservation.list_active_by_session",
            self.config.store_timeout,
            self.reservations.list_active_by_session(session_id),
        )
        .await
    }

    async fn load(&self, id: ReservationId) -> Result<Option<Reservation>, DropError> {
        within("reservation.get", self.config.store_timeout, self.reservations.get(id)).await
    }

    async fn require(&self, id: ReservationId) -> Result<Reservation, DropError> {
        self.load(id)
            .await?
            .ok_or_else(|| DropError::not_found("reservation", id))
    }

    fn not_active(reservation: &Reservation) -> DropError {
        DropError::InvalidState(format!(
            "reservation {} is {}",
            reservation.id, reservation.status
        ))
    }

    /// Apply the stock effect a terminal reservation owes, then clear its
    /// `stock_pending` mark. A confirmed reservation also notifies its order.
    async fn settle(&self, reservation: &Reservation) -> Result<(), DropError> {
        let (operation, delta) = match reservation.status {
            ReservationStatus::Confirmed => ("reservation.sell", StockDelta::sell(reservation.quantity)),
            ReservationStatus::Cancelled | ReservationStatus::Expired => {
                ("reservation.release", StockDelta::release(reservation.quantity))
            }
            ReservationStatus::Active => return Err(Self::not_active(reservation)),
        };

        if let Err(e) = self.stock_effect(operation, &reservation.product_id, delta).await {
            tracing::error!(
                reservation_id = %reservation.id,
                status = %reservation.status,
                product_id = %reservation.product_id,
                quantity = reservation.quantity,
                error = %e,
                "Reservation is terminal but its stock effect is not applied yet, left for the reaper"
            );
            return Err(e);
        }
        Self::record_terminal(reservation);

        let marked = retry_with_predicate(
            "reservation.mark_settled",
            &self.retry,
            || {
                within(
                    "reservation.mark_settled",
                    self.config.store_timeout,
                    self.reservations.mark_settled(reservation.id),
                )
            },
            DropError::is_retryable,
        )
        .await;
        if let Err(e) = marked {
            tracing::error!(
                reservation_id = %reservation.id,
                product_id = %reservation.product_id,
                error = %e,
                "Stock effect applied but the reservation is still marked pending"
            );
        }

        if reservation.status == ReservationStatus::Confirmed {
            self.notify_fulfilled(reservation).await;
        }
        Ok(())
    }

    async fn notify_fulfilled(&self, reservation: &Reservation) {
        let Some(order_id) = &reservation.order_id else {
            tracing::warn!(reservation_id = %reservation.id, "Confirmed reservation has no order to notify");
            return;
        };
        if let Err(e) = self
            .orders
            .order_fulfilled(order_id, &reservation.product_id, reservation.quantity)
            .await
        {
            tracing::error!(order_id = %order_id, reservation_id = %reservation.id, error = %e, "Order fulfilment notification failed");
        }
    }

    async fn stock_effect(
        &self,
        operation: &'static str,
        product_id: &ProductId,
        delta: StockDelta,
    ) -> Result<StockRecord, DropError> {
        retry_with_predicate(
            operation,
            &self.retry,
            || self.ledger.apply(product_id, delta),
            DropError::is_retryable,
        )
        .await
    }

    fn record_terminal(reservation: &Reservation) {
        let held_for = (reservation.updated_at - reservation.created_at)
            .to_std()
            .unwrap_or_default();
        metrics::record_reservation_terminal(reservation.status, reservation.quantity, held_for);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::fixtures::Harness;
    use chrono::{DateTime, Utc};
    use flashdrop_core::store::StoreFuture;
    use flashdrop_testing::InMemoryReservationStore;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Cancels the reservation behind the caller's back right before the
    /// next transition is forwarded.
    struct CancelsFirst {
        inner: InMemoryReservationStore,
        armed: AtomicBool,
    }

    impl ReservationStore for CancelsFirst {
        fn insert(&self, reservation: Reservation) -> StoreFuture<'_, bool> {
            self.inner.insert(reservation)
        }

        fn get(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
            self.inner.get(id)
        }

        fn transition(
            &self,
            id: ReservationId,
            to: ReservationStatus,
            order_id: Option<OrderId>,
            at: DateTime<Utc>,
        ) -> StoreFuture<'_, Option<Reservation>> {
            Box::pin(async move {
                if self.armed.swap(false, Ordering::SeqCst) {
                    self.inner.transition(id, ReservationStatus::Cancelled, None, at).await?;
                }
                self.inner.transition(id, to, order_id, at).await
            })
        }

        fn attach_order(
            &self,
            id: ReservationId,
            order_id: OrderId,
            at: DateTime<Utc>,
        ) -> StoreFuture<'_, Option<Reservation>> {
            self.inner.attach_order(id, order_id, at)
        }

        fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>> {
            self.inner.list_expired(now, limit)
        }

        fn list_active_by_product(&self, product_id: &ProductId) -> StoreFuture<'_, Vec<Reservation>> {
            self.inner.list_active_by_product(product_id)
        }

        fn list_active_by_session(&self, session_id: &SessionId) -> StoreFuture<'_, Vec<Reservation>> {
            self.inner.list_active_by_session(session_id)
        }

        fn list_by_order(&self, order_id: &OrderId) -> StoreFuture<'_, Vec<Reservation>> {
            self.inner.list_by_order(order_id)
        }

        fn list_unsettled(&self, before: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>> {
            self.inner.list_unsettled(before, limit)
        }

        fn claim_settlement(
            &self,
            id: ReservationId,
            seen: DateTime<Utc>,
            at: DateTime<Utc>,
        ) -> StoreFuture<'_, bool> {
            self.inner.claim_settlement(id, seen, at)
        }

        fn mark_settled(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
            self.inner.mark_settled(id)
        }
    }

    #[tokio::test]
    async fn create_holds_stock_and_cancel_returns_it() {
        let h = Harness::new();
        let held = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 2, "s1"))
            .await
            .unwrap();
        assert_eq!(h.available("p1"), 3);
        assert_eq!(held.expires_at, h.clock.now() + chrono::Duration::minutes(15));

        h.services.reservations.cancel(held.id).await.unwrap();
        h.services.reservations.cancel(held.id).await.unwrap();
        assert_eq!(h.available("p1"), 5);
    }

    #[tokio::test]
    async fn quantity_limits_are_enforced() {
        let h = Harness::new();
        let zero = h.services.reservations.create(CreateReservation::new("p1", 0, "s1")).await;
        let huge = h.services.reservations.create(CreateReservation::new("p1", 11, "s1")).await;
        assert!(matches!(zero, Err(DropError::InvalidRequest(_))));
        assert!(matches!(huge, Err(DropError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn insufficient_stock_leaves_the_ledger_untouched() {
        let h = Harness::new();
        let err = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 6, "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DropError::InsufficientStock { requested: 6, available: 5, .. }));
        assert_eq!(h.available("p1"), 5);
    }

    #[tokio::test]
    async fn retried_create_with_same_id_holds_once() {
        let h = Harness::new();
        let id = ReservationId::new();
        let request = CreateReservation::new("p1", 2, "s1").with_id(id);

        let first = h.services.reservations.create(request.clone()).await.unwrap();
        let second = h.services.reservations.create(request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.available("p1"), 3);

        let reused = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 1, "s1").with_id(id))
            .await;
        assert!(matches!(reused, Err(DropError::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn failed_insert_releases_the_hold() {
        let h = Harness::new();
        h.reservation_store.faults.set_fail_writes(true);

        let err = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 2, "s1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DropError::Store(_)));
        assert_eq!(h.available("p1"), 5);
    }

    #[tokio::test]
    async fn confirm_sells_and_notifies_the_order_service() {
        let h = Harness::new();
        let held = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 2, "s1"))
            .await
            .unwrap();

        let confirmed = h
            .services
            .reservations
            .confirm(held.id, OrderId::new("o1"))
            .await
            .unwrap();
        assert_eq!(confirmed.status, ReservationStatus::Confirmed);
        assert_eq!(confirmed.order_id, Some(OrderId::new("o1")));

        let record = h.stock("p1");
        assert_eq!((record.quantity, record.reserved), (3, 0));
        assert_eq!(h.orders.fulfilled().len(), 1);

        let again = h.services.reservations.confirm(held.id, OrderId::new("o1")).await;
        assert!(matches!(again, Err(DropError::InvalidState(_))));
        let cancel = h.services.reservations.cancel(held.id).await;
        assert_eq!(cancel, Err(DropError::CannotCancelConfirmed(held.id)));
    }

    #[tokio::test]
    async fn confirm_after_deadline_expires_and_releases() {
        let h = Harness::new();
        let held = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 1, "s1").with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(61));

        let view = h.services.reservations.status(held.id).await.unwrap();
        assert!(view.past_deadline);
        assert_eq!(view.reservation.status, ReservationStatus::Active);
        assert_eq!(h.available("p1"), 4);

        let err = h
            .services
            .reservations
            .confirm(held.id, OrderId::new("o1"))
            .await
            .unwrap_err();
        assert_eq!(err, DropError::Expired(held.id));
        assert_eq!(h.available("p1"), 5);
        assert_eq!(
            h.services.reservations.status(held.id).await.unwrap().reservation.status,
            ReservationStatus::Expired
        );
    }

    #[tokio::test]
    async fn late_confirm_beaten_by_a_cancel_reports_the_cancel() {
        let h = Harness::new();
        let store = Arc::new(CancelsFirst {
            inner: h.reservation_store.clone(),
            armed: AtomicBool::new(false),
        });
        let manager = ReservationManager::new(
            h.services.reservations.ledger().clone(),
            store.clone(),
            Arc::new(h.orders.clone()),
            Arc::new(h.clock.clone()),
            ReservationConfig::default(),
        );
        let held = manager
            .create(CreateReservation::new("p1", 2, "s1").with_ttl(Duration::from_secs(60)))
            .await
            .unwrap();
        h.clock.advance(chrono::Duration::seconds(61));

        store.armed.store(true, Ordering::SeqCst);
        let err = manager.confirm(held.id, OrderId::new("o1")).await.unwrap_err();

        assert!(matches!(&err, DropError::InvalidState(msg) if msg.ends_with("is cancelled")));
        assert_ne!(err, DropError::Expired(held.id));
        let stored = h.reservation_store.all().remove(0);
        assert_eq!(stored.status, ReservationStatus::Cancelled);

        h.clock.advance(chrono::Duration::seconds(61));
        h.services.reaper.sweep_once().await.unwrap();
        assert_eq!(h.available("p1"), 5);
    }

    #[tokio::test]
    async fn cancel_whose_release_fails_is_settled_by_the_reaper() {
        let h = Harness::new();
        let held = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 2, "s1"))
            .await
            .unwrap();

        h.stock_store.faults.set_fail_writes(true);
        let err = h.services.reservations.cancel(held.id).await.unwrap_err();
        h.stock_store.faults.set_fail_writes(false);
        assert!(matches!(err, DropError::Store(_)));

        let again = h.services.reservations.cancel(held.id).await.unwrap();
        assert_eq!(again.status, ReservationStatus::Cancelled);
        assert!(again.stock_pending);
        assert_eq!(h.stock("p1").reserved, 2);

        h.clock.advance(chrono::Duration::seconds(61));
        let report = h.services.reaper.sweep_once().await.unwrap();
        assert_eq!(report.resettled, 1);
        assert_eq!(h.stock("p1").reserved, 0);
        assert_eq!(h.available("p1"), 5);
    }

    #[tokio::test]
    async fn sale_lost_to_a_ledger_fault_is_applied_and_notified_later() {
        let h = Harness::new();
        let held = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 2, "s1"))
            .await
            .unwrap();

        h.stock_store.faults.set_fail_writes(true);
        let err = h.services.reservations.confirm(held.id, OrderId::new("o1")).await;
        h.stock_store.faults.set_fail_writes(false);
        assert!(matches!(err, Err(DropError::Store(_))));
        assert!(h.orders.fulfilled().is_empty());

        h.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(h.services.reaper.sweep_once().await.unwrap().resettled, 1);

        let record = h.stock("p1");
        assert_eq!((record.quantity, record.reserved), (3, 0));
        assert_eq!(h.orders.fulfilled().len(), 1);
    }

    #[tokio::test]
    async fn confirm_on_cancelled_reservation_is_invalid() {
        let h = Harness::new();
        let held = h
            .services
            .reservations
            .create(CreateReservation::new("p1", 1, "s1"))
            .await
            .unwrap();
        h.services.reservations.cancel(held.id).await.unwrap();

        let err = h
            .services
            .reservations
            .confirm(held.id, OrderId::new("o1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DropError::InvalidState(_)));
        assert_eq!(h.available("p1"), 5);
    }

    #[tokio::test]
    async fn unknown_reservations_are_not_found() {
        let h = Harness::new();
        let id = ReservationId::new();
        assert_eq!(
            h.services.reservations.cancel(id).await,
            Err(DropError::not_found("reservation", id))
        );
    }

    #[tokio::test]
    async fn checkout_attaches_orders_and_session_cancel_releases() {
        let h = Harness::new();
        let session = SessionId::new("s1");
        h.services.reservations.create(CreateReservation::new("p1", 1, "s1")).await.unwrap();
        h.services.reservations.create(CreateReservation::new("p2", 3, "s1")).await.unwrap();
        h.services.reservations.create(CreateReservation::new("p2", 1, "s2")).await.unwrap();

        let order = OrderId::new("o1");
        let attached = h.services.reservations.begin_checkout(&session, &order).await.unwrap();
        assert_eq!(attached.len(), 2);
        assert_eq!(h.services.reservations.list_by_order(&order).await.unwrap().len(), 2);

        let cancelled = h.services.reservations.cancel_for_session(&session).await.unwrap();
        assert_eq!(cancelled.len(), 2);
        assert_eq!(h.available("p1"), 5);
        assert_eq!(h.available("p2"), 49);
    }
}
