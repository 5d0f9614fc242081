//! In-memory store implementations.
//!
//! Each store honors the same compare-and-swap contract as the Postgres
//! implementation, so concurrency tests exercise the real retry loops.
//! [`StoreFaults`] injects latency and outages for timeout and compensation
//! tests.

use flashdrop_core::queue::DropQueue;
use flashdrop_core::reservation::{Reservation, ReservationStatus};
use flashdrop_core::stock::StockRecord;
use flashdrop_core::store::{QueueStore, ReservationStore, StockStore, StoreError, StoreFuture};
use flashdrop_core::types::{DropId, OrderId, ProductId, ReservationId, SellerId, SessionId};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

/// Switches for simulating a slow or broken store.
#[derive(Debug, Clone, Default)]
pub struct StoreFaults {
    latency_ms: Arc<AtomicU64>,
    unavailable: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
}

impl StoreFaults {
    /// Delay every call by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms.store(
            u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
            Ordering::SeqCst,
        );
    }

    /// Fail every call with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Fail inserts and writes with [`StoreError::Database`]; reads still work.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    async fn before_read(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected outage".into()));
        }
        Ok(())
    }

    async fn before_write(&self) -> Result<(), StoreError> {
        self.before_read().await?;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Database("injected write failure".into()));
        }
        Ok(())
    }
}

// ============================================================================
// Stock
// ============================================================================

/// In-memory [`StockStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockStore {
    records: Arc<RwLock<HashMap<ProductId, StockRecord>>>,
    cas_conflicts: Arc<AtomicU64>,
    /// Fault injection
    pub faults: StoreFaults,
}

impl InMemoryStockStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a record directly, bypassing the ledger.
    pub fn seed(&self, record: StockRecord) {
        self.records
            .write()
            .unwrap()
            .insert(record.product_id.clone(), record);
    }

    /// Read a record synchronously.
    #[must_use]
    pub fn peek(&self, product_id: &ProductId) -> Option<StockRecord> {
        self.records.read().unwrap().get(product_id).cloned()
    }

    /// Number of compare-and-swap writes that lost.
    #[must_use]
    pub fn cas_conflicts(&self) -> u64 {
        self.cas_conflicts.load(Ordering::SeqCst)
    }

    fn filtered(&self, keep: impl Fn(&StockRecord) -> bool) -> Vec<StockRecord> {
        let mut records: Vec<_> = self
            .records
            .read()
            .unwrap()
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.product_id.cmp(&b.product_id));
        records
    }
}

impl StockStore for InMemoryStockStore {
    fn get(&self, product_id: &ProductId) -> StoreFuture<'_, Option<StockRecord>> {
        let product_id = product_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.peek(&product_id))
        })
    }

    fn insert_if_absent(&self, record: StockRecord) -> StoreFuture<'_, StockRecord> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut records = self.records.write().unwrap();
            Ok(records
                .entry(record.product_id.clone())
                .or_insert(record)
                .clone())
        })
    }

    fn compare_and_swap(&self, expected_revision: u64, next: StockRecord) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut records = self.records.write().unwrap();
            match records.get_mut(&next.product_id) {
                Some(current) if current.revision == expected_revision => {
                    *current = next;
                    Ok(true)
                }
                _ => {
                    self.cas_conflicts.fetch_add(1, Ordering::SeqCst);
                    Ok(false)
                }
            }
        })
    }

    fn list_by_seller(&self, seller_id: &SellerId) -> StoreFuture<'_, Vec<StockRecord>> {
        let seller_id = seller_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.filtered(|r| r.seller_id == seller_id))
        })
    }

    fn list_by_drop(&self, drop_id: &DropId) -> StoreFuture<'_, Vec<StockRecord>> {
        let drop_id = drop_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.filtered(|r| r.drop_id == drop_id))
        })
    }

    fn list_low_stock(&self, seller_id: Option<&SellerId>) -> StoreFuture<'_, Vec<StockRecord>> {
        let seller_id = seller_id.cloned();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.filtered(|r| {
                r.is_low() && seller_id.as_ref().is_none_or(|s| &r.seller_id == s)
            }))
        })
    }
}

// ============================================================================
// Reservations
// ============================================================================

/// In-memory [`ReservationStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryReservationStore {
    reservations: Arc<RwLock<HashMap<ReservationId, Reservation>>>,
    /// Fault injection
    pub faults: StoreFaults,
}

impl InMemoryReservationStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored reservation, in no particular order.
    #[must_use]
    pub fn all(&self) -> Vec<Reservation> {
        self.reservations.read().unwrap().values().cloned().collect()
    }

    /// Sum of `quantity` over `active` reservations of a product.
    #[must_use]
    pub fn active_units(&self, product_id: &ProductId) -> u32 {
        self.reservations
            .read()
            .unwrap()
            .values()
            .filter(|r| r.is_active() && &r.product_id == product_id)
            .map(|r| r.quantity)
            .sum()
    }

    fn filtered(&self, keep: impl Fn(&Reservation) -> bool) -> Vec<Reservation> {
        let mut found: Vec<_> = self
            .reservations
            .read()
            .unwrap()
            .values()
            .filter(|r| keep(r))
            .cloned()
            .collect();
        found.sort_by_key(|r| (r.created_at, *r.id.as_uuid()));
        found
    }
}

impl ReservationStore for InMemoryReservationStore {
    fn insert(&self, reservation: Reservation) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut reservations = self.reservations.write().unwrap();
            if reservations.contains_key(&reservation.id) {
                return Ok(false);
            }
            reservations.insert(reservation.id, reservation);
            Ok(true)
        })
    }

    fn get(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.reservations.read().unwrap().get(&id).cloned())
        })
    }

    fn transition(
        &self,
        id: ReservationId,
        to: ReservationStatus,
        order_id: Option<OrderId>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut reservations = self.reservations.write().unwrap();
            let Some(reservation) = reservations.get_mut(&id) else {
                return Ok(None);
            };
            if !reservation.is_active() {
                return Ok(None);
            }
            reservation.status = to;
            if order_id.is_some() {
                reservation.order_id = order_id;
            }
            reservation.updated_at = at;
            reservation.stock_pending = true;
            Ok(Some(reservation.clone()))
        })
    }

    fn attach_order(
        &self,
        id: ReservationId,
        order_id: OrderId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut reservations = self.reservations.write().unwrap();
            match reservations.get_mut(&id) {
                Some(reservation) if reservation.is_active() => {
                    reservation.order_id = Some(order_id);
                    reservation.updated_at = at;
                    Ok(Some(reservation.clone()))
                }
                _ => Ok(None),
            }
        })
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            self.faults.before_read().await?;
            let mut expired = self.filtered(|r| r.is_active() && r.expires_at < now);
            expired.sort_by_key(|r| r.expires_at);
            expired.truncate(limit);
            Ok(expired)
        })
    }

    fn list_active_by_product(&self, product_id: &ProductId) -> StoreFuture<'_, Vec<Reservation>> {
        let product_id = product_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.filtered(|r| r.is_active() && r.product_id == product_id))
        })
    }

    fn list_active_by_session(&self, session_id: &SessionId) -> StoreFuture<'_, Vec<Reservation>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.filtered(|r| r.is_active() && r.session_id == session_id))
        })
    }

    fn list_by_order(&self, order_id: &OrderId) -> StoreFuture<'_, Vec<Reservation>> {
        let order_id = order_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.filtered(|r| r.order_id.as_ref() == Some(&order_id)))
        })
    }

    fn list_unsettled(&self, before: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            self.faults.before_read().await?;
            let mut unsettled = self.filtered(|r| r.is_unsettled() && r.updated_at < before);
            unsettled.sort_by_key(|r| r.updated_at);
            unsettled.truncate(limit);
            Ok(unsettled)
        })
    }

    fn claim_settlement(
        &self,
        id: ReservationId,
        seen: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut reservations = self.reservations.write().unwrap();
            match reservations.get_mut(&id) {
                Some(reservation) if reservation.is_unsettled() && reservation.updated_at == seen => {
                    reservation.updated_at = at;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn mark_settled(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut reservations = self.reservations.write().unwrap();
            match reservations.get_mut(&id) {
                Some(reservation) if reservation.is_unsettled() => {
                    reservation.stock_pending = false;
                    Ok(Some(reservation.clone()))
                }
                _ => Ok(None),
            }
        })
    }
}

// ============================================================================
// Queues
// ============================================================================

/// In-memory [`QueueStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryQueueStore {
    queues: Arc<RwLock<HashMap<DropId, DropQueue>>>,
    /// Fault injection
    pub faults: StoreFaults,
}

impl InMemoryQueueStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a queue synchronously.
    #[must_use]
    pub fn peek(&self, drop_id: &DropId) -> Option<DropQueue> {
        self.queues.read().unwrap().get(drop_id).cloned()
    }
}

impl QueueStore for InMemoryQueueStore {
    fn load(&self, drop_id: &DropId) -> StoreFuture<'_, Option<DropQueue>> {
        let drop_id = drop_id.clone();
        Box::pin(async move {
            self.faults.before_read().await?;
            Ok(self.peek(&drop_id))
        })
    }

    fn create(&self, queue: DropQueue) -> StoreFuture<'_, DropQueue> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut queues = self.queues.write().unwrap();
            Ok(queues.entry(queue.drop_id.clone()).or_insert(queue).clone())
        })
    }

    fn compare_and_swap(&self, expected_revision: u64, next: DropQueue) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.faults.before_write().await?;
            let mut queues = self.queues.write().unwrap();
            match queues.get_mut(&next.drop_id) {
                Some(current) if current.revision == expected_revision => {
                    *current = next;
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    fn list_drops(&self) -> StoreFuture<'_, Vec<DropId>> {
        Box::pin(async move {
            self.faults.before_read().await?;
            let mut drops: Vec<_> = self.queues.read().unwrap().keys().cloned().collect();
            drops.sort();
            Ok(drops)
        })
    }
}
