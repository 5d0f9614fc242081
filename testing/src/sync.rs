//! In-memory sync bus and snapshot store.
//!
//! [`InMemorySyncBus`] keeps one `tokio::sync::broadcast` channel per drop
//! channel name, so several "replicas" in one test process see each other's
//! events exactly like they would over Redis.

use flashdrop_core::sync::{DropSyncEvent, SnapshotStore, SyncBus, SyncError, SyncFuture, SyncStream};
use flashdrop_core::types::DropId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, broadcast};

const CHANNEL_CAPACITY: usize = 1024;

type Channels = Arc<RwLock<HashMap<String, broadcast::Sender<DropSyncEvent>>>>;

/// In-memory [`SyncBus`].
#[derive(Debug, Clone, Default)]
pub struct InMemorySyncBus {
    channels: Channels,
    published: Arc<Mutex<Vec<DropSyncEvent>>>,
    failing: Arc<AtomicBool>,
}

impl InMemorySyncBus {
    /// Create a bus with no channels
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Every event successfully published, in publish order.
    #[must_use]
    pub fn published(&self) -> Vec<DropSyncEvent> {
        self.published.lock().unwrap().clone()
    }

    /// Events successfully published for one drop.
    #[must_use]
    pub fn published_for(&self, drop_id: &DropId) -> Vec<DropSyncEvent> {
        self.published()
            .into_iter()
            .filter(|e| &e.drop_id == drop_id)
            .collect()
    }

    /// Live subscriptions on a drop's channel.
    pub async fn receiver_count(&self, drop_id: &DropId) -> usize {
        self.channels
            .read()
            .await
            .get(&DropSyncEvent::channel_for(drop_id))
            .map_or(0, broadcast::Sender::receiver_count)
    }

    /// Forget recorded publishes.
    pub fn clear(&self) {
        self.published.lock().unwrap().clear();
    }

    async fn sender(&self, channel: String) -> broadcast::Sender<DropSyncEvent> {
        let mut channels = self.channels.write().await;
        channels
            .entry(channel)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl SyncBus for InMemorySyncBus {
    fn publish(&self, event: &DropSyncEvent) -> SyncFuture<'_, ()> {
        let event = event.clone();
        Box::pin(async move {
            let channel = event.channel();
            if self.failing.load(Ordering::SeqCst) {
                return Err(SyncError::PublishFailed {
                    channel,
                    reason: "injected failure".into(),
                });
            }
            let sender = self.sender(channel).await;
            // No receivers is not an error for pub/sub
            let _ = sender.send(event.clone());
            self.published.lock().unwrap().push(event);
            Ok(())
        })
    }

    fn subscribe(&self, drop_id: &DropId) -> SyncFuture<'_, SyncStream> {
        let channel = DropSyncEvent::channel_for(drop_id);
        Box::pin(async move {
            let mut receiver = self.sender(channel).await.subscribe();
            let stream = async_stream::stream! {
                loop {
                    match receiver.recv().await {
                        Ok(event) => yield Ok(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield Err(SyncError::Lagged(skipped));
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            };
            Ok(Box::pin(stream) as SyncStream)
        })
    }
}

/// In-memory [`SnapshotStore`].
#[derive(Debug, Clone, Default)]
pub struct InMemorySnapshotStore {
    drops: Arc<Mutex<HashMap<DropId, HashMap<String, DropSyncEvent>>>>,
    failing: Arc<AtomicBool>,
}

impl InMemorySnapshotStore {
    /// Create an empty snapshot store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail until switched back.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), SyncError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Snapshot("injected failure".into()));
        }
        Ok(())
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn put_if_newer(&self, event: &DropSyncEvent) -> SyncFuture<'_, bool> {
        let event = event.clone();
        Box::pin(async move {
            self.check()?;
            let mut drops = self.drops.lock().unwrap();
            let keys = drops.entry(event.drop_id.clone()).or_default();
            let newer = keys
                .get(&event.key)
                .is_none_or(|stored| event.is_newer_than(stored.revision, stored.last_updated));
            if newer {
                keys.insert(event.key.clone(), event);
            }
            Ok(newer)
        })
    }

    fn snapshot(&self, drop_id: &DropId) -> SyncFuture<'_, Vec<DropSyncEvent>> {
        let drop_id = drop_id.clone();
        Box::pin(async move {
            self.check()?;
            let drops = self.drops.lock().unwrap();
            let mut events: Vec<_> = drops
                .get(&drop_id)
                .map(|keys| keys.values().cloned().collect())
                .unwrap_or_default();
            events.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(events)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashdrop_core::stock::StockRecord;
    use flashdrop_core::types::{ProductId, SellerId};
    use futures::StreamExt;

    fn event(revision: u64) -> DropSyncEvent {
        let mut record = StockRecord::new(
            ProductId::new("p1"),
            SellerId::new("s1"),
            DropId::new("d1"),
            5,
            1,
            Utc::now(),
        );
        record.revision = revision;
        DropSyncEvent::stock_update(&record)
    }

    #[tokio::test]
    async fn subscribers_receive_events_published_after_subscribing() {
        let bus = InMemorySyncBus::new();
        let mut stream = bus.subscribe(&DropId::new("d1")).await.unwrap();
        bus.publish(&event(1)).await.unwrap();

        let received = stream.next().await.unwrap().unwrap();
        assert_eq!(received.revision, 1);
    }

    #[tokio::test]
    async fn failing_bus_records_nothing() {
        let bus = InMemorySyncBus::new();
        bus.set_failing(true);
        assert!(bus.publish(&event(1)).await.is_err());
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn snapshot_keeps_only_the_newest_revision() {
        let snapshots = InMemorySnapshotStore::new();
        assert!(snapshots.put_if_newer(&event(2)).await.unwrap());
        assert!(!snapshots.put_if_newer(&event(1)).await.unwrap());

        let snapshot = snapshots.snapshot(&DropId::new("d1")).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].revision, 2);
    }
}
