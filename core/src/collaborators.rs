//! Interfaces to systems outside the drop service.

use crate::stock::StockRecord;
use crate::types::{DropId, OrderId, ProductId, SellerId};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Boxed future returned by collaborator calls.
pub type CollaboratorFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, CollaboratorError>> + Send + 'a>>;

/// Errors reported by collaborator clients.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// The collaborator does not know the entity
    #[error("Not found: {0}")]
    NotFound(String),

    /// Transport failure or non-success response
    #[error("Request failed: {0}")]
    Request(String),

    /// Response body could not be decoded
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Catalog entry used to lazily create a stock record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogProduct {
    /// Product identity
    pub product_id: ProductId,
    /// Owning seller
    pub seller_id: SellerId,
    /// Drop the product is listed in
    pub drop_id: DropId,
    /// Units on sale
    pub quantity: u32,
    /// Threshold for the low-stock signal
    #[serde(default)]
    pub low_stock_threshold: u32,
}

/// Product catalog.
pub trait CatalogService: Send + Sync {
    /// Look up a product.
    fn get_product(&self, product_id: &ProductId) -> CollaboratorFuture<'_, CatalogProduct>;
}

/// Order service notified of completed sales.
pub trait OrderService: Send + Sync {
    /// Report that `quantity` units of `product_id` were sold under `order_id`.
    fn order_fulfilled(
        &self,
        order_id: &OrderId,
        product_id: &ProductId,
        quantity: u32,
    ) -> CollaboratorFuture<'_, ()>;
}

/// Receiver of low-stock signals.
pub trait StockAlertSink: Send + Sync {
    /// Called once when a record's `available` first drops to or below its threshold.
    fn low_stock(&self, record: &StockRecord) -> CollaboratorFuture<'_, ()>;
}
