use crate::{PostgresStore, revision_param, timed, to_revision, to_u32};
use flashdrop_core::stock::StockRecord;
use flashdrop_core::store::{StockStore, StoreError, StoreFuture};
use flashdrop_core::types::{DropId, ProductId, SellerId};
use flashdrop_runtime::metrics::StoreMetrics;
use sqlx::Row;
use sqlx::postgres::PgRow;

const STOCK_COLUMNS: &str = "product_id, seller_id, drop_id, quantity, reserved, \
     low_stock_threshold, low_stock_alert_sent, revision, updated_at";

fn stock_from_row(row: &PgRow) -> Result<StockRecord, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
    Ok(StockRecord {
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(decode)?),
        seller_id: SellerId::new(row.try_get::<String, _>("seller_id").map_err(decode)?),
        drop_id: DropId::new(row.try_get::<String, _>("drop_id").map_err(decode)?),
        quantity: to_u32(row.try_get("quantity").map_err(decode)?, "quantity")?,
        reserved: to_u32(row.try_get("reserved").map_err(decode)?, "reserved")?,
        low_stock_threshold: to_u32(
            row.try_get("low_stock_threshold").map_err(decode)?,
            "low_stock_threshold",
        )?,
        low_stock_alert_sent: row.try_get("low_stock_alert_sent").map_err(decode)?,
        revision: to_revision(row.try_get("revision").map_err(decode)?)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
    })
}

fn rows_to_records(rows: &[PgRow]) -> Result<Vec<StockRecord>, StoreError> {
    rows.iter().map(stock_from_row).collect()
}

impl StockStore for PostgresStore {
    fn get(&self, product_id: &ProductId) -> StoreFuture<'_, Option<StockRecord>> {
        let product_id = product_id.clone();
        Box::pin(async move {
            let query = format!("SELECT {STOCK_COLUMNS} FROM stock_records WHERE product_id = $1");
            let row = timed(
                "stock",
                "get",
                sqlx::query(&query)
                    .bind(product_id.as_str())
                    .fetch_optional(&self.pool),
            )
            .await?;
            row.as_ref().map(stock_from_row).transpose()
        })
    }

    fn insert_if_absent(&self, record: StockRecord) -> StoreFuture<'_, StockRecord> {
        Box::pin(async move {
            let query = format!(
                "INSERT INTO stock_records ({STOCK_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                 ON CONFLICT (product_id) DO NOTHING"
            );
            timed(
                "stock",
                "insert",
                sqlx::query(&query)
                    .bind(record.product_id.as_str())
                    .bind(record.seller_id.as_str())
                    .bind(record.drop_id.as_str())
                    .bind(i64::from(record.quantity))
                    .bind(i64::from(record.reserved))
                    .bind(i64::from(record.low_stock_threshold))
                    .bind(record.low_stock_alert_sent)
                    .bind(revision_param(record.revision)?)
                    .bind(record.updated_at)
                    .execute(&self.pool),
            )
            .await?;

            StockStore::get(self, &record.product_id)
                .await?
                .ok_or_else(|| {
                    StoreError::Database(format!(
                        "stock record {} missing after insert",
                        record.product_id
                    ))
                })
        })
    }

    fn compare_and_swap(&self, expected_revision: u64, next: StockRecord) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = timed(
                "stock",
                "compare_and_swap",
                sqlx::query(
                    r"
                    UPDATE stock_records
                    SET quantity = $2,
                        reserved = $3,
                        low_stock_threshold = $4,
                        low_stock_alert_sent = $5,
                        revision = $6,
                        updated_at = $7
                    WHERE product_id = $1 AND revision = $8
                    ",
                )
                .bind(next.product_id.as_str())
                .bind(i64::from(next.quantity))
                .bind(i64::from(next.reserved))
                .bind(i64::from(next.low_stock_threshold))
                .bind(next.low_stock_alert_sent)
                .bind(revision_param(next.revision)?)
                .bind(next.updated_at)
                .bind(revision_param(expected_revision)?)
                .execute(&self.pool),
            )
            .await?;

            let swapped = result.rows_affected() == 1;
            if !swapped {
                StoreMetrics::record_cas_conflict("stock");
            }
            Ok(swapped)
        })
    }

    fn list_by_seller(&self, seller_id: &SellerId) -> StoreFuture<'_, Vec<StockRecord>> {
        let seller_id = seller_id.clone();
        Box::pin(async move {
            let query = format!(
                "SELECT {STOCK_COLUMNS} FROM stock_records WHERE seller_id = $1 ORDER BY product_id"
            );
            let rows = timed(
                "stock",
                "list_by_seller",
                sqlx::query(&query)
                    .bind(seller_id.as_str())
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_records(&rows)
        })
    }

    fn list_by_drop(&self, drop_id: &DropId) -> StoreFuture<'_, Vec<StockRecord>> {
        let drop_id = drop_id.clone();
        Box::pin(async move {
            let query = format!(
                "SELECT {STOCK_COLUMNS} FROM stock_records WHERE drop_id = $1 ORDER BY product_id"
            );
            let rows = timed(
                "stock",
                "list_by_drop",
                sqlx::query(&query)
                    .bind(drop_id.as_str())
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_records(&rows)
        })
    }

    fn list_low_stock(&self, seller_id: Option<&SellerId>) -> StoreFuture<'_, Vec<StockRecord>> {
        let seller_id = seller_id.map(|s| s.as_str().to_string());
        Box::pin(async move {
            let query = format!(
                "SELECT {STOCK_COLUMNS} FROM stock_records \
                 WHERE available <= low_stock_threshold \
                   AND ($1::TEXT IS NULL OR seller_id = $1) \
                 ORDER BY available, product_id"
            );
            let rows = timed(
                "stock",
                "list_low_stock",
                sqlx::query(&query).bind(seller_id).fetch_all(&self.pool),
            )
            .await?;
            rows_to_records(&rows)
        })
    }
}
