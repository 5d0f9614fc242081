//! Stock ledger: the only writer of `(quantity, reserved)`.
//!
//! Every mutation is a compare-and-swap on the record's `revision`: load,
//! apply the pure [`StockRecord::apply_delta`] transition, and write back only
//! if nobody else wrote in between. A loser reloads and re-validates against
//! the fresh record, so `reserved > quantity` is rejected at commit time rather
//! than at read time.

use crate::config::LedgerConfig;
use crate::deadline::within;
use crate::metrics;
use crate::sync::SyncFabric;
use flashdrop_core::DropError;
use flashdrop_core::collaborators::{CatalogService, CollaboratorError, StockAlertSink};
use flashdrop_core::environment::Clock;
use flashdrop_core::stock::{StockDelta, StockRecord, ThresholdCrossing};
use flashdrop_core::store::StockStore;
use flashdrop_core::sync::DropSyncEvent;
use flashdrop_core::types::{DropId, ProductId, SellerId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Absolute correction for one product.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockAdjustment {
    /// Product to correct
    pub product_id: ProductId,
    /// New total quantity, if changing
    pub quantity: Option<u32>,
    /// New low-stock threshold, if changing
    pub low_stock_threshold: Option<u32>,
}

/// Per-product outcome of [`StockLedger::bulk_update`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AdjustmentOutcome {
    /// Product the adjustment targeted
    pub product_id: ProductId,
    /// Record after the adjustment, or why it was refused
    pub result: Result<StockRecord, DropError>,
}

/// Stock ledger service.
#[derive(Clone)]
pub struct StockLedger {
    stocks: Arc<dyn StockStore>,
    catalog: Arc<dyn CatalogService>,
    alerts: Arc<dyn StockAlertSink>,
    sync: SyncFabric,
    clock: Arc<dyn Clock>,
    config: LedgerConfig,
}

impl StockLedger {
    /// Create a ledger.
    #[must_use]
    pub fn new(
        stocks: Arc<dyn StockStore>,
        catalog: Arc<dyn CatalogService>,
        alerts: Arc<dyn StockAlertSink>,
        sync: SyncFabric,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Self {
        Self {
            stocks,
            catalog,
            alerts,
            sync,
            clock,
            config,
        }
    }

    /// Load a product's record, creating it from the catalog on first reference.
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the catalog does not know the product
    /// - [`DropError::Collaborator`] if the catalog is unreachable
    /// - [`DropError::Timeout`] / [`DropError::Store`] on store failure
    pub async fn get_or_init(&self, product_id: &ProductId) -> Result<StockRecord, DropError> {
        let budget = self.config.store_timeout;
        if let Some(record) = within("stock.get", budget, self.stocks.get(product_id)).await? {
            return Ok(record);
        }

        let product = self
            .catalog
            .get_product(product_id)
            .await
            .map_err(|e| match e {
                CollaboratorError::NotFound(_) => DropError::not_found("product", product_id),
                other => DropError::Collaborator(other.to_string()),
            })?;

        let fresh = StockRecord::new(
            product.product_id,
            product.seller_id,
            product.drop_id,
            product.quantity,
            product.low_stock_threshold,
            self.clock.now(),
        );
        // Another replica may have initialised it first; the store returns the winner.
        let record = within("stock.insert", budget, self.stocks.insert_if_absent(fresh)).await?;
        tracing::info!(
            product_id = %record.product_id,
            drop_id = %record.drop_id,
            quantity = record.quantity,
            "Stock record initialised from catalog"
        );
        Ok(record)
    }

    /// Apply a delta atomically.
    ///
    /// On success the new state is broadcast as a `stock-update`, and a
    /// downward threshold crossing fires the low-stock alert once.
    ///
    /// # Errors
    ///
    /// - [`DropError::InsufficientStock`] if the delta would drive `reserved > quantity`
    /// - [`DropError::Conflict`] if contention outlasted `max_cas_attempts`, or an
    ///   `expected_quantity` no longer matches
    /// - any error of [`StockLedger::get_or_init`]
    pub async fn apply(&self, product_id: &ProductId, delta: StockDelta) -> Result<StockRecord, DropError> {
        let budget = self.config.store_timeout;

        for attempt in 1..=self.config.max_cas_attempts {
            let current = self.get_or_init(product_id).await?;
            let (next, crossing) = current.apply_delta(&delta, self.clock.now())?;

            let swapped = within(
                "stock.compare_and_swap",
                budget,
                self.stocks.compare_and_swap(current.revision, next.clone()),
            )
            .await?;

            if !swapped {
                tracing::debug!(product_id = %product_id, attempt, "Stock write lost a race, retrying");
                continue;
            }

            metrics::record_cas_attempts(attempt);
            metrics::record_stock(&next);
            tracing::debug!(
                product_id = %next.product_id,
                quantity = next.quantity,
                reserved = next.reserved,
                available = next.available(),
                revision = next.revision,
                "Stock updated"
            );

            if let Some(crossing) = crossing {
                self.on_threshold_crossing(&next, crossing).await;
            }
            if let Err(e) = self.sync.publish(&DropSyncEvent::stock_update(&next)).await {
                tracing::debug!(product_id = %next.product_id, error = %e, "Stock update left for the relay");
            }
            return Ok(next);
        }

        tracing::warn!(
            product_id = %product_id,
            attempts = self.config.max_cas_attempts,
            "Stock write abandoned under contention"
        );
        Err(DropError::Conflict(format!("stock record {product_id}")))
    }

    async fn on_threshold_crossing(&self, record: &StockRecord, crossing: ThresholdCrossing) {
        match crossing {
            ThresholdCrossing::EnteredLowStock => {
                metrics::record_low_stock_alert();
                tracing::warn!(
                    product_id = %record.product_id,
                    seller_id = %record.seller_id,
                    available = record.available(),
                    threshold = record.low_stock_threshold,
                    "Product entered low stock"
                );
                if let Err(e) = self.alerts.low_stock(record).await {
                    tracing::error!(product_id = %record.product_id, error = %e, "Low-stock alert failed");
                }
            }
            ThresholdCrossing::RecoveredAboveThreshold => {
                tracing::info!(
                    product_id = %record.product_id,
                    available = record.available(),
                    "Product recovered above low-stock threshold"
                );
            }
        }
    }

    /// Current record for a product (`stock.getForProduct`).
    ///
    /// # Errors
    ///
    /// Same as [`StockLedger::get_or_init`].
    pub async fn get_for_product(&self, product_id: &ProductId) -> Result<StockRecord, DropError> {
        self.get_or_init(product_id).await
    }

    /// Every record owned by a seller (`stock.getForSeller`).
    ///
    /// # Errors
    ///
    /// Returns [`DropError::Timeout`] or [`DropError::Store`] on store failure.
    pub async fn get_for_seller(&self, seller_id: &SellerId) -> Result<Vec<StockRecord>, DropError> {
        within(
            "stock.list_by_seller",
            self.config.store_timeout,
            self.stocks.list_by_seller(seller_id),
        )
        .await
    }

    /// Records at or below their threshold, optionally for one seller (`stock.lowStock`).
    ///
    /// # Errors
    ///
    /// Returns [`DropError::Timeout`] or [`DropError::Store`] on store failure.
    pub async fn low_stock(&self, seller_id: Option<&SellerId>) -> Result<Vec<StockRecord>, DropError> {
        within(
            "stock.list_low_stock",
            self.config.store_timeout,
            self.stocks.list_low_stock(seller_id),
        )
        .await
    }

    /// Every record of a drop.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::Timeout`] or [`DropError::Store`] on store failure.
    pub async fn snapshot_for_drop(&self, drop_id: &DropId) -> Result<Vec<StockRecord>, DropError> {
        within(
            "stock.list_by_drop",
            self.config.store_timeout,
            self.stocks.list_by_drop(drop_id),
        )
        .await
    }

    /// Apply admin corrections (`stock.bulkUpdate`).
    ///
    /// Each adjustment goes through [`StockLedger::apply`] as a delta computed
    /// from the quantity it was read at. If a sale lands in between, the delta
    /// is recomputed from the fresh quantity. A target below the units
    /// currently held is refused with `InsufficientStock`.
    pub async fn bulk_update(&self, adjustments: Vec<StockAdjustment>) -> Vec<AdjustmentOutcome> {
        let mut outcomes = Vec::with_capacity(adjustments.len());
        for adjustment in adjustments {
            let result = self.adjust(&adjustment).await;
            match &result {
                Ok(record) => tracing::info!(
                    product_id = %record.product_id,
                    quantity = record.quantity,
                    threshold = record.low_stock_threshold,
                    "Stock corrected"
                ),
                Err(e) => tracing::warn!(
                    product_id = %adjustment.product_id,
                    error = %e,
                    "Stock correction refused"
                ),
            }
            outcomes.push(AdjustmentOutcome {
                product_id: adjustment.product_id,
                result,
            });
        }
        outcomes
    }

    async fn adjust(&self, adjustment: &StockAdjustment) -> Result<StockRecord, DropError> {
        let mut last_conflict = None;
        for _ in 0..self.config.max_cas_attempts {
            let current = self.get_or_init(&adjustment.product_id).await?;
            let target = adjustment.quantity.unwrap_or(current.quantity);
            let mut delta = StockDelta::correct_quantity(current.quantity, target);
            if let Some(threshold) = adjustment.low_stock_threshold {
                delta = delta.with_threshold(threshold);
            }
            if delta.is_noop() {
                return Ok(current);
            }

            match self.apply(&adjustment.product_id, delta).await {
                Err(e @ DropError::Conflict(_)) => last_conflict = Some(e),
                other => return other,
            }
        }
        Err(last_conflict
            .unwrap_or_else(|| DropError::Conflict(format!("stock record {}", adjustment.product_id))))
    }
}
