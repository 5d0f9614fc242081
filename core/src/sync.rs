//! Drop sync events and the publish/subscribe seams.
//!
//! Every ledger or queue mutation produces one [`DropSyncEvent`] on the drop's
//! channel (`drop:{drop_id}`). Delivery is at-least-once and unordered across
//! keys, so every event carries the `revision` of the record it describes and
//! subscribers pass events through a [`VersionGate`] that discards anything not
//! newer than what they already applied for that key.
//!
//! ```text
//!  ledger.apply ──┐                          ┌──► replica A ── VersionGate ──► clients
//!                 ├─► SnapshotStore (hash) ──┤
//!  queue.leave ───┘   SyncBus (channel)  ────┴──► replica B ── VersionGate ──► clients
//! ```

use crate::queue::DropQueue;
use crate::stock::{StockRecord, StockStatus};
use crate::types::{DropId, ProductId, UserId};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Key used for the single queue entry of a drop's snapshot.
pub const QUEUE_KEY: &str = "queue";

/// Key of a product's stock entry. Namespaced so no product id can collide
/// with [`QUEUE_KEY`].
#[must_use]
pub fn stock_key(product_id: &ProductId) -> String {
    format!("stock:{product_id}")
}

/// Kind of mutation an event describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncEventKind {
    /// A stock record changed
    #[serde(rename = "stock-update")]
    StockUpdate,
    /// A drop queue changed
    #[serde(rename = "queue-update")]
    QueueUpdate,
}

impl SyncEventKind {
    /// Wire name of the kind.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::StockUpdate => "stock-update",
            Self::QueueUpdate => "queue-update",
        }
    }
}

/// State carried by an event. Always the full post-mutation state, never a diff.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncPayload {
    /// Stock after the mutation
    Stock {
        /// Product that changed
        product_id: ProductId,
        /// Total units on sale
        quantity: u32,
        /// Units held
        reserved: u32,
        /// `quantity - reserved`
        available: u32,
        /// Computed status
        status: StockStatus,
    },
    /// Queue after the mutation
    Queue {
        /// Admitted shoppers
        active: u32,
        /// Shoppers in line
        waiting: u32,
        /// Current bound
        max_concurrent_users: u32,
        /// Users admitted by this mutation
        promoted: Vec<UserId>,
    },
}

/// A stock or queue change broadcast to every replica and client of a drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropSyncEvent {
    /// Drop (and channel) the event belongs to
    pub drop_id: DropId,
    /// Mutation kind
    pub kind: SyncEventKind,
    /// Ordering key: [`stock_key`] for stock, [`QUEUE_KEY`] for the queue
    pub key: String,
    /// Revision of the record after the mutation
    pub revision: u64,
    /// Time of the mutation
    pub last_updated: DateTime<Utc>,
    /// Post-mutation state
    pub payload: SyncPayload,
}

impl DropSyncEvent {
    /// Event describing a stock record as written.
    #[must_use]
    pub fn stock_update(record: &StockRecord) -> Self {
        Self {
            drop_id: record.drop_id.clone(),
            kind: SyncEventKind::StockUpdate,
            key: stock_key(&record.product_id),
            revision: record.revision,
            last_updated: record.updated_at,
            payload: SyncPayload::Stock {
                product_id: record.product_id.clone(),
                quantity: record.quantity,
                reserved: record.reserved,
                available: record.available(),
                status: record.status(),
            },
        }
    }

    /// Event describing a queue as written.
    #[must_use]
    pub fn queue_update(queue: &DropQueue, promoted: Vec<UserId>) -> Self {
        Self {
            drop_id: queue.drop_id.clone(),
            kind: SyncEventKind::QueueUpdate,
            key: QUEUE_KEY.to_string(),
            revision: queue.revision,
            last_updated: queue.updated_at,
            payload: SyncPayload::Queue {
                active: queue.active_count(),
                waiting: queue.waiting_count(),
                max_concurrent_users: queue.max_concurrent_users,
                promoted,
            },
        }
    }

    /// Channel name for a drop.
    #[must_use]
    pub fn channel_for(drop_id: &DropId) -> String {
        format!("drop:{drop_id}")
    }

    /// Channel this event is published on.
    #[must_use]
    pub fn channel(&self) -> String {
        Self::channel_for(&self.drop_id)
    }

    /// Whether this event supersedes a previously applied `(revision, last_updated)`.
    #[must_use]
    pub fn is_newer_than(&self, revision: u64, last_updated: DateTime<Utc>) -> bool {
        self.revision > revision || (self.revision == revision && self.last_updated > last_updated)
    }
}

/// Subscriber-side filter enforcing per-key ordering.
#[derive(Debug, Default, Clone)]
pub struct VersionGate {
    applied: HashMap<String, (u64, DateTime<Utc>)>,
}

impl VersionGate {
    /// Create an empty gate.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `event` and return `true` if it is newer than anything seen for its key.
    pub fn admit(&mut self, event: &DropSyncEvent) -> bool {
        let newer = self
            .applied
            .get(&event.key)
            .is_none_or(|&(revision, at)| event.is_newer_than(revision, at));
        if newer {
            self.applied
                .insert(event.key.clone(), (event.revision, event.last_updated));
        }
        newer
    }

    /// Last applied revision for a key.
    #[must_use]
    pub fn revision_of(&self, key: &str) -> Option<u64> {
        self.applied.get(key).map(|&(revision, _)| revision)
    }
}

/// Errors that can occur on the sync bus or snapshot store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish to a channel
    #[error("Publish failed for channel '{channel}': {reason}")]
    PublishFailed {
        /// The channel that failed
        channel: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a channel
    #[error("Subscription failed for channel '{channel}': {reason}")]
    SubscriptionFailed {
        /// The channel that failed
        channel: String,
        /// The reason for failure
        reason: String,
    },

    /// An event could not be encoded or decoded
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Snapshot read or write failed
    #[error("Snapshot error: {0}")]
    Snapshot(String),

    /// The subscriber fell behind and missed events
    #[error("Subscriber lagged by {0} events")]
    Lagged(u64),
}

/// Boxed future returned by sync operations.
pub type SyncFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, SyncError>> + Send + 'a>>;

/// Stream of events from a subscription.
pub type SyncStream = Pin<Box<dyn Stream<Item = Result<DropSyncEvent, SyncError>> + Send>>;

/// Live channel per drop.
pub trait SyncBus: Send + Sync {
    /// Publish an event on its drop's channel.
    fn publish(&self, event: &DropSyncEvent) -> SyncFuture<'_, ()>;

    /// Attach to a drop's channel. Only events published after this resolves are delivered.
    fn subscribe(&self, drop_id: &DropId) -> SyncFuture<'_, SyncStream>;
}

/// Durable latest-state per `(drop, key)` for late joiners.
pub trait SnapshotStore: Send + Sync {
    /// Store `event` as the latest state for its key unless a newer one is stored.
    /// Returns whether it was written.
    fn put_if_newer(&self, event: &DropSyncEvent) -> SyncFuture<'_, bool>;

    /// Latest event for every key of a drop.
    fn snapshot(&self, drop_id: &DropId) -> SyncFuture<'_, Vec<DropSyncEvent>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SellerId;

    fn record(revision: u64, reserved: u32) -> StockRecord {
        let mut record = StockRecord::new(
            ProductId::new("p1"),
            SellerId::new("s1"),
            DropId::new("d1"),
            10,
            2,
            Utc::now(),
        );
        record.revision = revision;
        record.reserved = reserved;
        record
    }

    #[test]
    fn gate_discards_stale_and_duplicate_events() {
        let mut gate = VersionGate::new();
        let newer = DropSyncEvent::stock_update(&record(3, 4));
        let older = DropSyncEvent::stock_update(&record(2, 3));

        assert!(gate.admit(&newer));
        assert!(!gate.admit(&newer));
        assert!(!gate.admit(&older));
        assert_eq!(gate.revision_of("stock:p1"), Some(3));
    }

    #[test]
    fn gate_tracks_keys_independently() {
        let mut gate = VersionGate::new();
        let stock = DropSyncEvent::stock_update(&record(5, 0));
        let queue = DropSyncEvent::queue_update(&DropQueue::new(DropId::new("d1"), 2, Utc::now()), vec![]);

        assert!(gate.admit(&stock));
        assert!(gate.admit(&queue));
    }

    #[test]
    fn product_named_queue_does_not_shadow_the_queue() {
        let mut named_queue = record(7, 0);
        named_queue.product_id = ProductId::new("queue");
        let stock = DropSyncEvent::stock_update(&named_queue);
        let queue = DropSyncEvent::queue_update(&DropQueue::new(DropId::new("d1"), 2, Utc::now()), vec![]);
        assert_ne!(stock.key, queue.key);

        let mut gate = VersionGate::new();
        assert!(gate.admit(&stock));
        assert!(gate.admit(&queue));
        assert_eq!(gate.revision_of(QUEUE_KEY), Some(0));
        assert_eq!(gate.revision_of("stock:queue"), Some(7));
    }

    #[test]
    fn events_use_hyphenated_kinds_on_the_wire() {
        let event = DropSyncEvent::stock_update(&record(1, 1));
        let json = serde_json::to_value(&event).unwrap_or_default();
        assert_eq!(json["kind"], "stock-update");
        assert_eq!(json["payload"]["available"], 9);
        assert_eq!(event.channel(), "drop:d1");
    }
}
