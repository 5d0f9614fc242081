//! Fail-fast budget for store round-trips.
//!
//! No drop operation may block on the store longer than its budget. A
//! timed-out write may or may not have committed, so callers surface
//! [`DropError::Timeout`], which is retryable.

use flashdrop_core::DropError;
use flashdrop_core::store::StoreError;
use std::future::Future;
use std::time::Duration;

/// Await a store call within `budget`.
///
/// # Errors
///
/// - [`DropError::Timeout`] if the budget elapsed
/// - [`DropError::Store`] if the store call failed
pub async fn within<T, F>(operation: &'static str, budget: Duration, call: F) -> Result<T, DropError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(budget, call).await {
        Ok(result) => result.map_err(DropError::from),
        Err(_) => {
            tracing::warn!(operation, budget_ms = budget.as_millis(), "Store call timed out");
            Err(DropError::Timeout {
                operation,
                budget_ms: u64::try_from(budget.as_millis()).unwrap_or(u64::MAX),
            })
        }
    }
}
