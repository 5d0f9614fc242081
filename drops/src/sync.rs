//! Sync fabric: fan-out of stock and queue changes to every replica and client.
//!
//! Publishing writes the per-key snapshot first and then the live channel, so
//! a late joiner that reads the snapshot never sees less than what was
//! broadcast. Failures never reach the caller that triggered the mutation:
//! the event is parked in the outbox and the relay re-publishes it later.
//!
//! Subscribing attaches to the live channel *before* reading the snapshot.
//! Anything published in between shows up twice and the [`VersionGate`]
//! drops the older copy.

use crate::config::SyncConfig;
use flashdrop_core::DropError;
use flashdrop_core::environment::Clock;
use flashdrop_core::sync::{DropSyncEvent, SnapshotStore, SyncBus, SyncError, VersionGate};
use flashdrop_core::types::DropId;
use flashdrop_runtime::metrics::SyncBusMetrics;
use flashdrop_runtime::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError, HealthCheck, Outbox, OutboxEntry,
};
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Boxed future returned by [`SyncHandler::handle`].
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = ()> + Send + 'a>>;

/// Ordered, de-duplicated events of one drop.
pub type GatedStream = Pin<Box<dyn Stream<Item = DropSyncEvent> + Send>>;

/// Consumer of a drop's events, e.g. the WebSocket gateway room for that drop.
pub trait SyncHandler: Send + Sync {
    /// Apply one event. Events arrive newest-per-key only.
    fn handle(&self, event: DropSyncEvent) -> HandlerFuture<'_>;
}

impl<F> SyncHandler for F
where
    F: Fn(DropSyncEvent) + Send + Sync,
{
    fn handle(&self, event: DropSyncEvent) -> HandlerFuture<'_> {
        self(event);
        Box::pin(std::future::ready(()))
    }
}

/// Result of one outbox flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Events published
    pub delivered: usize,
    /// Events that failed again and were parked
    pub reparked: usize,
    /// Parked events skipped because a newer one for the same key was parked too
    pub superseded: usize,
}

/// Publish/subscribe front for one service replica.
///
/// Cloning is cheap; clones share the breaker and the outbox.
#[derive(Clone)]
pub struct SyncFabric {
    bus: Arc<dyn SyncBus>,
    snapshots: Arc<dyn SnapshotStore>,
    breaker: CircuitBreaker,
    outbox: Outbox<DropSyncEvent>,
    clock: Arc<dyn Clock>,
    config: SyncConfig,
}

fn unavailable(err: &SyncError) -> DropError {
    DropError::SyncUnavailable(err.to_string())
}

impl SyncFabric {
    /// Create a fabric over a bus and snapshot store.
    #[must_use]
    pub fn new(
        bus: Arc<dyn SyncBus>,
        snapshots: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let breaker = CircuitBreaker::new(
            "sync",
            CircuitBreakerConfig::builder()
                .failure_threshold(config.breaker_failure_threshold)
                .open_timeout(config.breaker_open_timeout)
                .build(),
        );
        let outbox = Outbox::new("sync", config.outbox_capacity);
        Self {
            bus,
            snapshots,
            breaker,
            outbox,
            clock,
            config,
        }
    }

    /// Publish an event, parking it in the outbox if delivery fails.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::SyncUnavailable`] if the event was parked instead
    /// of delivered. Callers log it and carry on; the mutation that produced
    /// the event stands.
    pub async fn publish(&self, event: &DropSyncEvent) -> Result<(), DropError> {
        match self.deliver(event).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    drop_id = %event.drop_id,
                    kind = event.kind.as_str(),
                    key = %event.key,
                    revision = event.revision,
                    error = %err,
                    "Sync publish failed, parking event"
                );
                self.outbox.park(event.clone(), err.to_string(), self.clock.now());
                Err(err)
            }
        }
    }

    async fn deliver(&self, event: &DropSyncEvent) -> Result<(), DropError> {
        self.breaker
            .call(|| async {
                self.snapshots.put_if_newer(event).await?;
                self.bus.publish(event).await
            })
            .await
            .map_err(|err| match err {
                CircuitBreakerError::Open => {
                    DropError::SyncUnavailable("circuit open".to_string())
                }
                CircuitBreakerError::Inner(e) => unavailable(&e),
            })
    }

    /// Re-publish parked events. Only the newest parked event per key is sent.
    pub async fn flush_outbox(&self) -> FlushReport {
        let parked = self.outbox.drain();
        if parked.is_empty() {
            return FlushReport::default();
        }

        let total = parked.len();
        let mut newest: HashMap<(DropId, String), OutboxEntry<DropSyncEvent>> = HashMap::new();
        for entry in parked {
            let slot = (entry.payload.drop_id.clone(), entry.payload.key.clone());
            let supersedes = newest.get(&slot).is_none_or(|kept| {
                entry
                    .payload
                    .is_newer_than(kept.payload.revision, kept.payload.last_updated)
            });
            if supersedes {
                newest.insert(slot, entry);
            }
        }

        let mut report = FlushReport {
            superseded: total - newest.len(),
            ..FlushReport::default()
        };
        for entry in newest.into_values() {
            match self.deliver(&entry.payload).await {
                Ok(()) => report.delivered += 1,
                Err(err) => {
                    self.outbox.repark(entry, err.to_string(), self.clock.now());
                    report.reparked += 1;
                }
            }
        }

        tracing::info!(
            delivered = report.delivered,
            reparked = report.reparked,
            superseded = report.superseded,
            "Flushed sync outbox"
        );
        report
    }

    /// Flush the outbox every `relay_interval` until shutdown.
    pub async fn run_relay(self, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.config.relay_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(interval_ms = self.config.relay_interval.as_millis(), "Sync relay started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !self.outbox.is_empty() {
                        self.flush_outbox().await;
                    }
                }
                _ = shutdown.recv() => {
                    if !self.outbox.is_empty() {
                        self.flush_outbox().await;
                    }
                    tracing::info!(parked = self.outbox.len(), "Sync relay stopped");
                    return;
                }
            }
        }
    }

    /// Latest state of every key of a drop, for reconnect bootstrap.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::SyncUnavailable`] if the snapshot cannot be read.
    pub async fn snapshot(&self, drop_id: &DropId) -> Result<Vec<DropSyncEvent>, DropError> {
        self.snapshots
            .snapshot(drop_id)
            .await
            .map_err(|e| unavailable(&e))
    }

    /// Snapshot followed by live events of a drop, newest-per-key only.
    ///
    /// # Errors
    ///
    /// Returns [`DropError::SyncUnavailable`] if the channel or the snapshot
    /// is unreachable.
    pub async fn subscribe(&self, drop_id: &DropId) -> Result<GatedStream, DropError> {
        let mut live = self
            .bus
            .subscribe(drop_id)
            .await
            .map_err(|e| unavailable(&e))?;
        let snapshot = self.snapshot(drop_id).await?;

        let snapshots = Arc::clone(&self.snapshots);
        let drop_id = drop_id.clone();
        let stream = async_stream::stream! {
            let mut gate = VersionGate::new();
            for event in snapshot {
                if gate.admit(&event) {
                    yield event;
                }
            }

            while let Some(item) = live.next().await {
                match item {
                    Ok(event) => {
                        if gate.admit(&event) {
                            yield event;
                        } else {
                            SyncBusMetrics::record_stale();
                        }
                    }
                    Err(SyncError::Lagged(skipped)) => {
                        tracing::warn!(drop_id = %drop_id, skipped, "Subscriber lagged, re-reading snapshot");
                        match snapshots.snapshot(&drop_id).await {
                            Ok(events) => {
                                for event in events {
                                    if gate.admit(&event) {
                                        yield event;
                                    }
                                }
                            }
                            Err(e) => tracing::warn!(drop_id = %drop_id, error = %e, "Snapshot re-read failed"),
                        }
                    }
                    Err(e) => tracing::warn!(drop_id = %drop_id, error = %e, "Dropping undecodable sync event"),
                }
            }
        };

        Ok(Box::pin(stream))
    }

    /// Drive `handler` from a drop's events on a background task, resubscribing
    /// whenever the subscription drops, until shutdown.
    pub fn spawn_subscriber(
        &self,
        drop_id: DropId,
        handler: Arc<dyn SyncHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        let fabric = self.clone();
        tokio::spawn(async move {
            // Survives resubscribes, so the handler never goes backwards.
            let mut gate = VersionGate::new();
            loop {
                let subscribed = tokio::select! {
                    result = fabric.subscribe(&drop_id) => result,
                    _ = shutdown.recv() => return,
                };

                match subscribed {
                    Ok(mut events) => {
                        tracing::info!(drop_id = %drop_id, "Sync subscriber attached");
                        loop {
                            tokio::select! {
                                next = events.next() => match next {
                                    Some(event) => {
                                        if gate.admit(&event) {
                                            handler.handle(event).await;
                                        }
                                    }
                                    None => break,
                                },
                                _ = shutdown.recv() => return,
                            }
                        }
                        tracing::warn!(drop_id = %drop_id, "Sync subscription ended, resubscribing");
                    }
                    Err(e) => {
                        tracing::warn!(drop_id = %drop_id, error = %e, "Sync subscribe failed, retrying");
                    }
                }

                tokio::select! {
                    () = tokio::time::sleep(fabric.config.resubscribe_delay) => {}
                    _ = shutdown.recv() => return,
                }
            }
        })
    }

    /// Events waiting in the outbox.
    #[must_use]
    pub fn parked(&self) -> usize {
        self.outbox.len()
    }

    /// Breaker and outbox health.
    #[must_use]
    pub fn health_checks(&self) -> Vec<HealthCheck> {
        vec![
            HealthCheck::for_breaker(&self.breaker),
            HealthCheck::for_outbox(&self.outbox, self.config.outbox_degraded_at),
        ]
    }
}
