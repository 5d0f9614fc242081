//! HTTP clients for the catalog and order services, and the log-based alert sink.

use flashdrop_core::collaborators::{
    CatalogProduct, CatalogService, CollaboratorError, CollaboratorFuture, OrderService,
    StockAlertSink,
};
use flashdrop_core::stock::StockRecord;
use flashdrop_core::types::{OrderId, ProductId};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::time::Duration;

fn http_client(timeout: Duration) -> Result<Client, CollaboratorError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| CollaboratorError::Request(e.to_string()))
}

fn base(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

/// Catalog service client.
///
/// `GET {base}/products/{product_id}` answering a [`CatalogProduct`] body.
#[derive(Clone, Debug)]
pub struct HttpCatalogClient {
    base_url: String,
    http_client: Client,
}

impl HttpCatalogClient {
    /// Create a client for the catalog at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            base_url: base(base_url),
            http_client: http_client(timeout)?,
        })
    }

    fn product_url(&self, product_id: &ProductId) -> String {
        format!("{}/products/{}", self.base_url, product_id)
    }
}

impl CatalogService for HttpCatalogClient {
    fn get_product(&self, product_id: &ProductId) -> CollaboratorFuture<'_, CatalogProduct> {
        let product_id = product_id.clone();
        Box::pin(async move {
            let response = self
                .http_client
                .get(self.product_url(&product_id))
                .send()
                .await
                .map_err(|e| CollaboratorError::Request(e.to_string()))?;

            if response.status() == StatusCode::NOT_FOUND {
                return Err(CollaboratorError::NotFound(product_id.to_string()));
            }
            if !response.status().is_success() {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                tracing::error!(product_id = %product_id, %status, body = %body, "Catalog lookup failed");
                return Err(CollaboratorError::Request(format!("catalog answered {status}")));
            }

            let product: CatalogProduct = response
                .json()
                .await
                .map_err(|e| CollaboratorError::InvalidResponse(e.to_string()))?;
            if product.product_id != product_id {
                return Err(CollaboratorError::InvalidResponse(format!(
                    "asked for product {product_id}, got {}",
                    product.product_id
                )));
            }
            Ok(product)
        })
    }
}

#[derive(Serialize)]
struct FulfillmentRequest<'a> {
    product_id: &'a ProductId,
    quantity: u32,
}

/// Order service client.
///
/// `POST {base}/orders/{order_id}/fulfillments` with `{product_id, quantity}`.
#[derive(Clone, Debug)]
pub struct HttpOrderClient {
    base_url: String,
    http_client: Client,
}

impl HttpOrderClient {
    /// Create a client for the order service at `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`CollaboratorError::Request`] if the HTTP client cannot be built.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, CollaboratorError> {
        Ok(Self {
            base_url: base(base_url),
            http_client: http_client(timeout)?,
        })
    }

    fn fulfillments_url(&self, order_id: &OrderId) -> String {
        format!("{}/orders/{}/fulfillments", self.base_url, order_id)
    }
}

impl OrderService for HttpOrderClient {
    fn order_fulfilled(
        &self,
        order_id: &OrderId,
        product_id: &ProductId,
        quantity: u32,
    ) -> CollaboratorFuture<'_, ()> {
        let order_id = order_id.clone();
        let product_id = product_id.clone();
        Box::pin(async move {
            let response = self
                .http_client
                .post(self.fulfillments_url(&order_id))
                .json(&FulfillmentRequest {
                    product_id: &product_id,
                    quantity,
                })
                .send()
                .await
                .map_err(|e| CollaboratorError::Request(e.to_string()))?;

            match response.status() {
                StatusCode::NOT_FOUND => Err(CollaboratorError::NotFound(order_id.to_string())),
                status if status.is_success() => {
                    tracing::debug!(order_id = %order_id, product_id = %product_id, quantity, "Order notified of fulfilment");
                    Ok(())
                }
                status => Err(CollaboratorError::Request(format!("order service answered {status}"))),
            }
        })
    }
}

/// Alert sink that only logs. Sellers' dashboards read `stock.lowStock`.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggingAlertSink;

impl StockAlertSink for LoggingAlertSink {
    fn low_stock(&self, record: &StockRecord) -> CollaboratorFuture<'_, ()> {
        tracing::warn!(
            product_id = %record.product_id,
            seller_id = %record.seller_id,
            drop_id = %record.drop_id,
            available = record.available(),
            threshold = record.low_stock_threshold,
            "Low stock"
        );
        Box::pin(std::future::ready(Ok(())))
    }
}
