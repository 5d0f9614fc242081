//! `PostgreSQL` stores for flash-sale drops.
//!
//! [`PostgresStore`] implements [`StockStore`](flashdrop_core::store::StockStore),
//! [`ReservationStore`](flashdrop_core::store::ReservationStore) and
//! [`QueueStore`](flashdrop_core::store::QueueStore) over one connection pool.
//!
//! Atomicity comes from single-statement conditional writes:
//!
//! - stock and queue rows are swapped with `UPDATE ... WHERE revision = $expected`
//! - reservations leave `active` with `UPDATE ... WHERE status = 'active' RETURNING *`
//!
//! The `stock_records` table also carries `CHECK (reserved >= 0 AND reserved <= quantity)`,
//! so a bug above the store can never persist an oversold row.
//!
//! # Example
//!
//! ```no_run
//! use flashdrop_postgres::PostgresStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PostgresStore::connect("postgres://localhost/drops", 20).await?;
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use flashdrop_core::store::StoreError;
use flashdrop_runtime::metrics::StoreMetrics;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::future::Future;
use std::time::{Duration, Instant};

mod queues;
mod reservations;
mod stock;

/// `PostgreSQL` implementation of the drop stores.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect a pool to `database_url`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database cannot be reached.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        tracing::info!(max_connections, "Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Wrap an existing pool.
    #[must_use]
    pub const fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create or upgrade the drop tables.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if a migration fails.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StoreError::Database(format!("Migration failed: {e}")))?;
        Ok(())
    }

    /// Round-trip a trivial query.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Unavailable`] if the database does not answer.
    pub async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;
        Ok(())
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

/// Run a query future, recording its latency and mapping the sqlx error.
async fn timed<T, F>(store: &'static str, operation: &'static str, query: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, sqlx::Error>>,
{
    let started = Instant::now();
    let result = query.await;
    StoreMetrics::record_operation(store, operation, started.elapsed());
    result.map_err(|e| {
        StoreMetrics::record_error(store, operation);
        tracing::error!(store, operation, error = %e, "Store query failed");
        map_sqlx_error(&e)
    })
}

fn map_sqlx_error(err: &sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
            StoreError::Unavailable(err.to_string())
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => {
            StoreError::Serialization(err.to_string())
        }
        _ => StoreError::Database(err.to_string()),
    }
}

/// Narrow a stored `BIGINT` to a `u32` field.
fn to_u32(value: i64, column: &str) -> Result<u32, StoreError> {
    u32::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("{column} out of range: {value}")))
}

/// Narrow a stored `BIGINT` revision.
fn to_revision(value: i64) -> Result<u64, StoreError> {
    u64::try_from(value)
        .map_err(|_| StoreError::Serialization(format!("revision out of range: {value}")))
}

/// Widen a revision for binding.
fn revision_param(revision: u64) -> Result<i64, StoreError> {
    i64::try_from(revision)
        .map_err(|_| StoreError::Serialization(format!("revision out of range: {revision}")))
}
