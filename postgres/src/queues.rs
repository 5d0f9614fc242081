use crate::{PostgresStore, revision_param, timed};
use flashdrop_core::queue::DropQueue;
use flashdrop_core::store::{QueueStore, StoreError, StoreFuture};
use flashdrop_core::types::DropId;
use flashdrop_runtime::metrics::StoreMetrics;
use sqlx::Row;
use sqlx::postgres::PgRow;

fn queue_from_row(row: &PgRow) -> Result<DropQueue, StoreError> {
    let state: serde_json::Value = row
        .try_get("state")
        .map_err(|e| StoreError::Serialization(e.to_string()))?;
    serde_json::from_value(state).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn queue_to_json(queue: &DropQueue) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(queue).map_err(|e| StoreError::Serialization(e.to_string()))
}

impl QueueStore for PostgresStore {
    fn load(&self, drop_id: &DropId) -> StoreFuture<'_, Option<DropQueue>> {
        let drop_id = drop_id.clone();
        Box::pin(async move {
            let row = timed(
                "queues",
                "load",
                sqlx::query("SELECT state FROM drop_queues WHERE drop_id = $1")
                    .bind(drop_id.as_str())
                    .fetch_optional(&self.pool),
            )
            .await?;
            row.as_ref().map(queue_from_row).transpose()
        })
    }

    fn create(&self, queue: DropQueue) -> StoreFuture<'_, DropQueue> {
        Box::pin(async move {
            timed(
                "queues",
                "create",
                sqlx::query(
                    r"
                    INSERT INTO drop_queues (drop_id, state, revision, updated_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (drop_id) DO NOTHING
                    ",
                )
                .bind(queue.drop_id.as_str())
                .bind(queue_to_json(&queue)?)
                .bind(revision_param(queue.revision)?)
                .bind(queue.updated_at)
                .execute(&self.pool),
            )
            .await?;

            self.load(&queue.drop_id).await?.ok_or_else(|| {
                StoreError::Database(format!("queue {} missing after insert", queue.drop_id))
            })
        })
    }

    fn compare_and_swap(&self, expected_revision: u64, next: DropQueue) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let result = timed(
                "queues",
                "compare_and_swap",
                sqlx::query(
                    r"
                    UPDATE drop_queues
                    SET state = $2, revision = $3, updated_at = $4
                    WHERE drop_id = $1 AND revision = $5
                    ",
                )
                .bind(next.drop_id.as_str())
                .bind(queue_to_json(&next)?)
                .bind(revision_param(next.revision)?)
                .bind(next.updated_at)
                .bind(revision_param(expected_revision)?)
                .execute(&self.pool),
            )
            .await?;

            let swapped = result.rows_affected() == 1;
            if !swapped {
                StoreMetrics::record_cas_conflict("queues");
            }
            Ok(swapped)
        })
    }

    fn list_drops(&self) -> StoreFuture<'_, Vec<DropId>> {
        Box::pin(async move {
            let rows = timed(
                "queues",
                "list_drops",
                sqlx::query("SELECT drop_id FROM drop_queues ORDER BY drop_id").fetch_all(&self.pool),
            )
            .await?;
            rows.iter()
                .map(|row| {
                    row.try_get::<String, _>("drop_id")
                        .map(DropId::new)
                        .map_err(|e| StoreError::Serialization(e.to_string()))
                })
                .collect()
        })
    }
}
