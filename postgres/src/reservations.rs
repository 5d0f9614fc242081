use crate::{PostgresStore, timed, to_u32};
use chrono::{DateTime, Utc};
use flashdrop_core::reservation::{Reservation, ReservationStatus};
use flashdrop_core::store::{ReservationStore, StoreError, StoreFuture};
use flashdrop_core::types::{OrderId, ProductId, ReservationId, SessionId};
use sqlx::Row;
use sqlx::postgres::PgRow;
use uuid::Uuid;

const RESERVATION_COLUMNS: &str =
    "id, product_id, quantity, session_id, expires_at, status, order_id, created_at, updated_at, stock_pending";

fn reservation_from_row(row: &PgRow) -> Result<Reservation, StoreError> {
    let decode = |e: sqlx::Error| StoreError::Serialization(e.to_string());
    let status: String = row.try_get("status").map_err(decode)?;
    Ok(Reservation {
        id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id").map_err(decode)?),
        product_id: ProductId::new(row.try_get::<String, _>("product_id").map_err(decode)?),
        quantity: to_u32(row.try_get("quantity").map_err(decode)?, "quantity")?,
        session_id: SessionId::new(row.try_get::<String, _>("session_id").map_err(decode)?),
        expires_at: row.try_get("expires_at").map_err(decode)?,
        status: ReservationStatus::parse(&status)
            .map_err(|e| StoreError::Serialization(e.to_string()))?,
        order_id: row
            .try_get::<Option<String>, _>("order_id")
            .map_err(decode)?
            .map(OrderId::new),
        created_at: row.try_get("created_at").map_err(decode)?,
        updated_at: row.try_get("updated_at").map_err(decode)?,
        stock_pending: row.try_get("stock_pending").map_err(decode)?,
    })
}

fn rows_to_reservations(rows: &[PgRow]) -> Result<Vec<Reservation>, StoreError> {
    rows.iter().map(reservation_from_row).collect()
}

impl ReservationStore for PostgresStore {
    fn insert(&self, reservation: Reservation) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let query = format!(
                "INSERT INTO reservations ({RESERVATION_COLUMNS}) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
                 ON CONFLICT (id) DO NOTHING"
            );
            let result = timed(
                "reservations",
                "insert",
                sqlx::query(&query)
                    .bind(reservation.id.as_uuid())
                    .bind(reservation.product_id.as_str())
                    .bind(i64::from(reservation.quantity))
                    .bind(reservation.session_id.as_str())
                    .bind(reservation.expires_at)
                    .bind(reservation.status.as_str())
                    .bind(reservation.order_id.as_ref().map(OrderId::as_str))
                    .bind(reservation.created_at)
                    .bind(reservation.updated_at)
                    .bind(reservation.stock_pending)
                    .execute(&self.pool),
            )
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn get(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            let query = format!("SELECT {RESERVATION_COLUMNS} FROM reservations WHERE id = $1");
            let row = timed(
                "reservations",
                "get",
                sqlx::query(&query)
                    .bind(id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .await?;
            row.as_ref().map(reservation_from_row).transpose()
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
            let query = format!(
                "UPDATE reservations \
                 SET status = $2, order_id = COALESCE($3, order_id), updated_at = $4, \
                     stock_pending = TRUE \
                 WHERE id = $1 AND status = 'active' \
                 RETURNING {RESERVATION_COLUMNS}"
            );
            let row = timed(
                "reservations",
                "transition",
                sqlx::query(&query)
                    .bind(id.as_uuid())
                    .bind(to.as_str())
                    .bind(order_id.as_ref().map(OrderId::as_str))
                    .bind(at)
                    .fetch_optional(&self.pool),
            )
            .await?;
            row.as_ref().map(reservation_from_row).transpose()
        })
    }

    fn attach_order(
        &self,
        id: ReservationId,
        order_id: OrderId,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            let query = format!(
                "UPDATE reservations SET order_id = $2, updated_at = $3 \
                 WHERE id = $1 AND status = 'active' \
                 RETURNING {RESERVATION_COLUMNS}"
            );
            let row = timed(
                "reservations",
                "attach_order",
                sqlx::query(&query)
                    .bind(id.as_uuid())
                    .bind(order_id.as_str())
                    .bind(at)
                    .fetch_optional(&self.pool),
            )
            .await?;
            row.as_ref().map(reservation_from_row).transpose()
        })
    }

    fn list_expired(&self, now: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE status = 'active' AND expires_at < $1 \
                 ORDER BY expires_at \
                 LIMIT $2"
            );
            let rows = timed(
                "reservations",
                "list_expired",
                sqlx::query(&query)
                    .bind(now)
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_reservations(&rows)
        })
    }

    fn list_active_by_product(&self, product_id: &ProductId) -> StoreFuture<'_, Vec<Reservation>> {
        let product_id = product_id.clone();
        Box::pin(async move {
            let query = format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE product_id = $1 AND status = 'active' ORDER BY created_at"
            );
            let rows = timed(
                "reservations",
                "list_active_by_product",
                sqlx::query(&query)
                    .bind(product_id.as_str())
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_reservations(&rows)
        })
    }

    fn list_active_by_session(&self, session_id: &SessionId) -> StoreFuture<'_, Vec<Reservation>> {
        let session_id = session_id.clone();
        Box::pin(async move {
            let query = format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE session_id = $1 AND status = 'active' ORDER BY created_at"
            );
            let rows = timed(
                "reservations",
                "list_active_by_session",
                sqlx::query(&query)
                    .bind(session_id.as_str())
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_reservations(&rows)
        })
    }

    fn list_by_order(&self, order_id: &OrderId) -> StoreFuture<'_, Vec<Reservation>> {
        let order_id = order_id.clone();
        Box::pin(async move {
            let query = format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE order_id = $1 ORDER BY created_at"
            );
            let rows = timed(
                "reservations",
                "list_by_order",
                sqlx::query(&query)
                    .bind(order_id.as_str())
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_reservations(&rows)
        })
    }

    fn list_unsettled(&self, before: DateTime<Utc>, limit: usize) -> StoreFuture<'_, Vec<Reservation>> {
        Box::pin(async move {
            let query = format!(
                "SELECT {RESERVATION_COLUMNS} FROM reservations \
                 WHERE stock_pending AND status <> 'active' AND updated_at < $1 \
                 ORDER BY updated_at \
                 LIMIT $2"
            );
            let rows = timed(
                "reservations",
                "list_unsettled",
                sqlx::query(&query)
                    .bind(before)
                    .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                    .fetch_all(&self.pool),
            )
            .await?;
            rows_to_reservations(&rows)
        })
    }

    fn claim_settlement(
        &self,
        id: ReservationId,
        seen: DateTime<Utc>,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = timed(
                "reservations",
                "claim_settlement",
                sqlx::query(
                    "UPDATE reservations SET updated_at = $3 \
                     WHERE id = $1 AND stock_pending AND status <> 'active' AND updated_at = $2",
                )
                .bind(id.as_uuid())
                .bind(seen)
                .bind(at)
                .execute(&self.pool),
            )
            .await?;
            Ok(result.rows_affected() == 1)
        })
    }

    fn mark_settled(&self, id: ReservationId) -> StoreFuture<'_, Option<Reservation>> {
        Box::pin(async move {
            let query = format!(
                "UPDATE reservations SET stock_pending = FALSE \
                 WHERE id = $1 AND stock_pending AND status <> 'active' \
                 RETURNING {RESERVATION_COLUMNS}"
            );
            let row = timed(
                "reservations",
                "mark_settled",
                sqlx::query(&query)
                    .bind(id.as_uuid())
                    .fetch_optional(&self.pool),
            )
            .await?;
            row.as_ref().map(reservation_from_row).transpose()
        })
    }
}
