//! Collaborator doubles.

use flashdrop_core::collaborators::{
    CatalogProduct, CatalogService, CollaboratorError, CollaboratorFuture, OrderService,
    StockAlertSink,
};
use flashdrop_core::stock::StockRecord;
use flashdrop_core::types::{DropId, OrderId, ProductId, SellerId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Catalog backed by a fixed product list.
#[derive(Debug, Clone, Default)]
pub struct StaticCatalog {
    products: Arc<RwLock<HashMap<ProductId, CatalogProduct>>>,
    lookups: Arc<AtomicUsize>,
}

impl StaticCatalog {
    /// Create an empty catalog
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a product and return the catalog (builder style).
    #[must_use]
    pub fn with_product(
        self,
        product_id: &str,
        drop_id: &str,
        quantity: u32,
        low_stock_threshold: u32,
    ) -> Self {
        self.insert(CatalogProduct {
            product_id: ProductId::new(product_id),
            seller_id: SellerId::new("seller-1"),
            drop_id: DropId::new(drop_id),
            quantity,
            low_stock_threshold,
        });
        self
    }

    /// Add or replace a product.
    pub fn insert(&self, product: CatalogProduct) {
        self.products
            .write()
            .unwrap()
            .insert(product.product_id.clone(), product);
    }

    /// Number of `get_product` calls served.
    #[must_use]
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

impl CatalogService for StaticCatalog {
    fn get_product(&self, product_id: &ProductId) -> CollaboratorFuture<'_, CatalogProduct> {
        let product_id = product_id.clone();
        Box::pin(async move {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            self.products
                .read()
                .unwrap()
                .get(&product_id)
                .cloned()
                .ok_or_else(|| CollaboratorError::NotFound(product_id.to_string()))
        })
    }
}

/// A fulfilled-order notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fulfillment {
    /// Order that was fulfilled
    pub order_id: OrderId,
    /// Product sold
    pub product_id: ProductId,
    /// Units sold
    pub quantity: u32,
}

/// Order service that records notifications.
#[derive(Debug, Clone, Default)]
pub struct RecordingOrderService {
    fulfilled: Arc<Mutex<Vec<Fulfillment>>>,
    failing: Arc<AtomicBool>,
}

impl RecordingOrderService {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every notification fail (after recording nothing).
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Notifications received so far.
    #[must_use]
    pub fn fulfilled(&self) -> Vec<Fulfillment> {
        self.fulfilled.lock().unwrap().clone()
    }
}

impl OrderService for RecordingOrderService {
    fn order_fulfilled(
        &self,
        order_id: &OrderId,
        product_id: &ProductId,
        quantity: u32,
    ) -> CollaboratorFuture<'_, ()> {
        let fulfillment = Fulfillment {
            order_id: order_id.clone(),
            product_id: product_id.clone(),
            quantity,
        };
        Box::pin(async move {
            if self.failing.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Request("order service down".into()));
            }
            self.fulfilled.lock().unwrap().push(fulfillment);
            Ok(())
        })
    }
}

/// Alert sink that records low-stock signals.
#[derive(Debug, Clone, Default)]
pub struct RecordingAlertSink {
    alerts: Arc<Mutex<Vec<StockRecord>>>,
}

impl RecordingAlertSink {
    /// Create an empty recorder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that triggered an alert, in order.
    #[must_use]
    pub fn alerts(&self) -> Vec<StockRecord> {
        self.alerts.lock().unwrap().clone()
    }
}

impl StockAlertSink for RecordingAlertSink {
    fn low_stock(&self, record: &StockRecord) -> CollaboratorFuture<'_, ()> {
        let record = record.clone();
        Box::pin(async move {
            self.alerts.lock().unwrap().push(record);
            Ok(())
        })
    }
}
