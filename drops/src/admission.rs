//! Queue admission controller: bounds concurrent shoppers per drop.
//!
//! The queue of a drop is one record. `join`, `leave` and capacity changes
//! are compare-and-swap writes of the whole [`DropQueue`], so promotion order
//! stays strict FIFO across replicas and `active` never exceeds the bound.

use crate::config::QueueConfig;
use crate::deadline::within;
use crate::metrics;
use crate::sync::SyncFabric;
use chrono::{DateTime, Utc};
use flashdrop_core::DropError;
use flashdrop_core::environment::Clock;
use flashdrop_core::queue::{ActiveEntry, DropQueue, JoinOutcome, LeaveOutcome, QueuePosition};
use flashdrop_core::store::QueueStore;
use flashdrop_core::sync::DropSyncEvent;
use flashdrop_core::types::{DropId, SessionId, UserId};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Answer to `queue.join` and `queue.status`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueTicket {
    /// Drop the ticket is for
    pub drop_id: DropId,
    /// Shopper
    pub user_id: UserId,
    /// Where the shopper stands
    pub position: QueuePosition,
    /// Whether the shopper may shop now
    pub admitted: bool,
    /// `position × average session`, zero unless waiting
    pub estimated_wait_seconds: u64,
}

/// Result of a queue edit, before it is written.
struct Change<T> {
    outcome: T,
    changed: bool,
    promoted: Vec<UserId>,
}

/// Admission controller service.
#[derive(Clone)]
pub struct AdmissionController {
    queues: Arc<dyn QueueStore>,
    sync: SyncFabric,
    clock: Arc<dyn Clock>,
    config: QueueConfig,
}

impl AdmissionController {
    /// Create a controller.
    #[must_use]
    pub fn new(
        queues: Arc<dyn QueueStore>,
        sync: SyncFabric,
        clock: Arc<dyn Clock>,
        config: QueueConfig,
    ) -> Self {
        Self {
            queues,
            sync,
            clock,
            config,
        }
    }

    /// Create a drop's queue, or change its bound.
    ///
    /// Raising the bound promotes waiting shoppers at once. The bound cannot
    /// be lowered below the shoppers already admitted.
    ///
    /// # Errors
    ///
    /// - [`DropError::InvalidRequest`] for a bound of zero
    /// - [`DropError::InvalidState`] for a bound below the active count
    /// - [`DropError::Conflict`] / [`DropError::Timeout`] / [`DropError::Store`]
    pub async fn configure_drop(
        &self,
        drop_id: &DropId,
        max_concurrent_users: u32,
    ) -> Result<DropQueue, DropError> {
        if max_concurrent_users == 0 {
            return Err(DropError::InvalidRequest(
                "max_concurrent_users must be at least 1".into(),
            ));
        }

        let fresh = DropQueue::new(drop_id.clone(), max_concurrent_users, self.clock.now());
        let stored = within("queue.create", self.config.store_timeout, self.queues.create(fresh)).await?;
        if stored.revision == 0 && stored.max_concurrent_users == max_concurrent_users {
            tracing::info!(drop_id = %drop_id, max_concurrent_users, "Drop queue created");
            metrics::record_queue(&stored);
            return Ok(stored);
        }

        let (queue, resized) = self
            .mutate(drop_id, |queue, now| {
                let revision = queue.revision;
                let resized = queue.set_capacity(max_concurrent_users, now);
                Change {
                    changed: queue.revision != revision,
                    promoted: resized.clone().unwrap_or_default(),
                    outcome: resized,
                }
            })
            .await?;
        let promoted = resized.inspect_err(|e| {
            tracing::warn!(drop_id = %drop_id, max_concurrent_users, error = %e, "Drop capacity change rejected");
        })?;
        tracing::info!(
            drop_id = %drop_id,
            max_concurrent_users,
            promoted = promoted.len(),
            "Drop capacity changed"
        );
        Ok(queue)
    }

    /// Enter a drop (`queue.join`) shopping with the given cart session.
    /// Joining again reports the current position.
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the drop has no queue
    /// - [`DropError::Conflict`] / [`DropError::Timeout`] / [`DropError::Store`]
    pub async fn join(
        &self,
        drop_id: &DropId,
        user_id: &UserId,
        session_id: &SessionId,
    ) -> Result<QueueTicket, DropError> {
        let (_, outcome) = self
            .mutate(drop_id, |queue, now| {
                let JoinOutcome { position, changed } =
                    queue.join(user_id.clone(), session_id.clone(), now);
                Change {
                    outcome: (position, changed),
                    changed,
                    promoted: Vec::new(),
                }
            })
            .await?;
        let (position, changed) = outcome;

        let ticket = self.ticket(drop_id, user_id, position);
        if changed {
            metrics::record_queue_join(ticket.admitted);
            tracing::info!(
                drop_id = %drop_id,
                user_id = %user_id,
                admitted = ticket.admitted,
                estimated_wait_seconds = ticket.estimated_wait_seconds,
                "Shopper joined drop"
            );
        }
        Ok(ticket)
    }

    /// Leave a drop (`queue.leave`), promoting the head of the line into a freed slot.
    ///
    /// Leaving a drop one is not in changes nothing.
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the drop has no queue
    /// - [`DropError::Conflict`] / [`DropError::Timeout`] / [`DropError::Store`]
    pub async fn leave(&self, drop_id: &DropId, user_id: &UserId) -> Result<LeaveOutcome, DropError> {
        let (_, outcome) = self
            .mutate(drop_id, |queue, now| {
                let outcome = queue.leave(user_id, now);
                Change {
                    changed: outcome.changed(),
                    promoted: outcome.promoted.clone(),
                    outcome,
                }
            })
            .await?;

        if let Some(from) = &outcome.removed_from {
            tracing::info!(
                drop_id = %drop_id,
                user_id = %user_id,
                from = ?from,
                promoted = outcome.promoted.len(),
                "Shopper left drop"
            );
        }
        Ok(outcome)
    }

    /// Where a shopper stands (`queue.status`). Unknown shoppers are `NotQueued`.
    ///
    /// # Errors
    ///
    /// - [`DropError::NotFound`] if the drop has no queue
    /// - [`DropError::Timeout`] / [`DropError::Store`]
    pub async fn status(&self, drop_id: &DropId, user_id: &UserId) -> Result<QueueTicket, DropError> {
        let queue = self.load(drop_id).await?;
        Ok(self.ticket(drop_id, user_id, queue.position_of(user_id)))
    }

    /// The whole queue of a drop.
    ///
    /// # Errors
    ///
    /// Same as [`AdmissionController::status`].
    pub async fn queue(&self, drop_id: &DropId) -> Result<DropQueue, DropError> {
        self.load(drop_id).await
    }

    /// Every drop with a queue.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn drops(&self) -> Result<Vec<DropId>, DropError> {
        within("queue.list_drops", self.config.store_timeout, self.queues.list_drops()).await
    }

    /// Active shoppers whose shopping window has elapsed, in admission order.
    ///
    /// Nothing is removed here; [`crate::session::SessionSweeper`] ends each
    /// returned session so its holds go back to stock with the queue slot.
    ///
    /// # Errors
    ///
    /// Same as [`AdmissionController::status`].
    pub async fn overstayed(&self, drop_id: &DropId) -> Result<Vec<ActiveEntry>, DropError> {
        let window = chrono::Duration::from_std(self.config.shopping_window)
            .map_err(|_| DropError::InvalidRequest("shopping window out of range".into()))?;
        let queue = self.load(drop_id).await?;
        Ok(queue.overstayed(self.clock.now(), window))
    }

    fn ticket(&self, drop_id: &DropId, user_id: &UserId, position: QueuePosition) -> QueueTicket {
        let estimated_wait_seconds = match position {
            QueuePosition::Waiting { position } => {
                u64::from(position).saturating_mul(self.config.average_session.as_secs())
            }
            QueuePosition::Active { .. } | QueuePosition::NotQueued => 0,
        };
        QueueTicket {
            drop_id: drop_id.clone(),
            user_id: user_id.clone(),
            admitted: matches!(position, QueuePosition::Active { .. }),
            position,
            estimated_wait_seconds,
        }
    }

    async fn load(&self, drop_id: &DropId) -> Result<DropQueue, DropError> {
        within("queue.load", self.config.store_timeout, self.queues.load(drop_id))
            .await?
            .ok_or_else(|| DropError::not_found("drop", drop_id))
    }

    /// Read, edit and write back a queue until the write wins.
    ///
    /// An edit that changes nothing is not written. A won write is published
    /// as one `queue-update`.
    async fn mutate<T>(
        &self,
        drop_id: &DropId,
        mut edit: impl FnMut(&mut DropQueue, DateTime<Utc>) -> Change<T>,
    ) -> Result<(DropQueue, T), DropError> {
        for attempt in 1..=self.config.max_cas_attempts {
            let current = self.load(drop_id).await?;
            let mut next = current.clone();
            let change = edit(&mut next, self.clock.now());
            if !change.changed {
                return Ok((current, change.outcome));
            }

            let swapped = within(
                "queue.compare_and_swap",
                self.config.store_timeout,
                self.queues.compare_and_swap(current.revision, next.clone()),
            )
            .await?;
            if !swapped {
                tracing::debug!(drop_id = %drop_id, attempt, "Queue write lost a race, retrying");
                continue;
            }

            metrics::record_queue(&next);
            metrics::record_queue_promotions(change.promoted.len());
            for user_id in &change.promoted {
                tracing::info!(drop_id = %drop_id, user_id = %user_id, "Shopper promoted");
            }
            let event = DropSyncEvent::queue_update(&next, change.promoted);
            if let Err(e) = self.sync.publish(&event).await {
                tracing::debug!(drop_id = %drop_id, error = %e, "Queue update left for the relay");
            }
            return Ok((next, change.outcome));
        }

        tracing::warn!(
            drop_id = %drop_id,
            attempts = self.config.max_cas_attempts,
            "Queue write abandoned under contention"
        );
        Err(DropError::Conflict(format!("queue of drop {drop_id}")))
    }
}
