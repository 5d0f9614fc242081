use crate::snapshot::RedisSnapshotStore;
use crate::connection_error;
use flashdrop_core::sync::{DropSyncEvent, SyncBus, SyncError, SyncFuture, SyncStream};
use flashdrop_core::types::DropId;
use flashdrop_runtime::metrics::SyncBusMetrics;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use std::time::{Duration, Instant};

/// Redis pub/sub implementation of [`SyncBus`].
///
/// Publishing goes through a shared [`ConnectionManager`], which reconnects on
/// its own. Every subscription opens a dedicated pub/sub connection because a
/// Redis connection in subscribe mode cannot issue regular commands.
#[derive(Clone)]
pub struct RedisSyncBus {
    client: redis::Client,
    manager: ConnectionManager,
    key_prefix: String,
    publish_timeout: Duration,
}

impl std::fmt::Debug for RedisSyncBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSyncBus")
            .field("key_prefix", &self.key_prefix)
            .field("publish_timeout", &self.publish_timeout)
            .finish_non_exhaustive()
    }
}

impl RedisSyncBus {
    /// Connect with default configuration.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConnectionFailed`] if the URL is invalid or Redis
    /// cannot be reached.
    pub async fn connect(url: &str) -> Result<Self, SyncError> {
        Self::builder().url(url).build().await
    }

    /// Create a new builder for configuring the bus.
    #[must_use]
    pub fn builder() -> RedisSyncBusBuilder {
        RedisSyncBusBuilder::default()
    }

    /// Snapshot store sharing this bus's connection and key prefix.
    ///
    /// `ttl` bounds how long a drop's snapshot survives its last write.
    #[must_use]
    pub fn snapshot_store(&self, ttl: Option<Duration>) -> RedisSnapshotStore {
        RedisSnapshotStore::new(self.manager.clone(), self.key_prefix.clone(), ttl)
    }

    /// Channel a drop's events are published on.
    #[must_use]
    pub fn channel_name(&self, drop_id: &DropId) -> String {
        format!("{}{}", self.key_prefix, DropSyncEvent::channel_for(drop_id))
    }

    /// Issue a `PING` over the shared connection.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConnectionFailed`] if Redis does not answer.
    pub async fn ping(&self) -> Result<(), SyncError> {
        let mut conn = self.manager.clone();
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| connection_error(&e))?;
        Ok(())
    }
}

/// Builder for configuring a [`RedisSyncBus`].
///
/// # Example
///
/// ```no_run
/// use flashdrop_redis::RedisSyncBus;
/// use std::time::Duration;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bus = RedisSyncBus::builder()
///     .url("redis://localhost:6379")
///     .publish_timeout(Duration::from_millis(500))
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct RedisSyncBusBuilder {
    url: Option<String>,
    key_prefix: Option<String>,
    publish_timeout: Option<Duration>,
}

impl RedisSyncBusBuilder {
    /// Set the Redis URL (e.g. `redis://localhost:6379`).
    #[must_use]
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    /// Prefix applied to every channel and key, for sharing one Redis between
    /// environments.
    #[must_use]
    pub fn key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = Some(prefix.into());
        self
    }

    /// Upper bound on a single `PUBLISH` round-trip (default: 1s).
    #[must_use]
    pub const fn publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = Some(timeout);
        self
    }

    /// Connect and build the bus.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::ConnectionFailed`] if:
    /// - URL not set or invalid
    /// - Redis cannot be reached
    pub async fn build(self) -> Result<RedisSyncBus, SyncError> {
        let url = self
            .url
            .ok_or_else(|| SyncError::ConnectionFailed("Redis URL not configured".to_string()))?;

        let client = redis::Client::open(url.as_str()).map_err(|e| connection_error(&e))?;
        let manager = ConnectionManager::new(client.clone())
            .await
            .map_err(|e| connection_error(&e))?;

        let key_prefix = self.key_prefix.unwrap_or_default();
        let publish_timeout = self.publish_timeout.unwrap_or(Duration::from_secs(1));

        tracing::info!(
            key_prefix = %key_prefix,
            publish_timeout_ms = publish_timeout.as_millis(),
            "RedisSyncBus connected"
        );

        Ok(RedisSyncBus {
            client,
            manager,
            key_prefix,
            publish_timeout,
        })
    }
}

impl SyncBus for RedisSyncBus {
    fn publish(&self, event: &DropSyncEvent) -> SyncFuture<'_, ()> {
        let event = event.clone();
        Box::pin(async move {
            let channel = self.channel_name(&event.drop_id);
            let kind = event.kind.as_str();

            let payload = serde_json::to_string(&event).map_err(|e| SyncError::PublishFailed {
                channel: channel.clone(),
                reason: format!("Failed to serialize event: {e}"),
            })?;

            let started = Instant::now();
            let mut conn = self.manager.clone();
            let publish = async {
                let receivers: redis::RedisResult<i64> = redis::cmd("PUBLISH")
                    .arg(&channel)
                    .arg(payload)
                    .query_async(&mut conn)
                    .await;
                receivers
            };

            let receivers = match tokio::time::timeout(self.publish_timeout, publish).await {
                Ok(Ok(receivers)) => receivers,
                Ok(Err(e)) => {
                    SyncBusMetrics::record_publish_error(kind);
                    return Err(SyncError::PublishFailed {
                        channel,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    SyncBusMetrics::record_publish_error(kind);
                    return Err(SyncError::PublishFailed {
                        channel,
                        reason: format!("timed out after {:?}", self.publish_timeout),
                    });
                }
            };

            SyncBusMetrics::record_publish(kind, started.elapsed());
            tracing::debug!(
                channel = %channel,
                kind,
                key = %event.key,
                revision = event.revision,
                receivers,
                "Published drop event"
            );
            Ok(())
        })
    }

    fn subscribe(&self, drop_id: &DropId) -> SyncFuture<'_, SyncStream> {
        let channel = self.channel_name(drop_id);
        Box::pin(async move {
            let mut pubsub = self
                .client
                .get_async_pubsub()
                .await
                .map_err(|e| SyncError::SubscriptionFailed {
                    channel: channel.clone(),
                    reason: e.to_string(),
                })?;
            pubsub
                .subscribe(&channel)
                .await
                .map_err(|e| SyncError::SubscriptionFailed {
                    channel: channel.clone(),
                    reason: e.to_string(),
                })?;

            tracing::info!(channel = %channel, "Subscribed to drop channel");

            let stream = async_stream::stream! {
                let mut messages = Box::pin(pubsub.into_on_message());
                while let Some(message) = messages.next().await {
                    yield decode_message(&message);
                }
                tracing::warn!(channel = %channel, "Drop channel subscription closed");
            };

            Ok(Box::pin(stream) as SyncStream)
        })
    }
}

fn decode_message(message: &redis::Msg) -> Result<DropSyncEvent, SyncError> {
    let payload: String = message
        .get_payload()
        .map_err(|e| SyncError::Serialization(e.to_string()))?;
    let event = decode_event(&payload)?;
    SyncBusMetrics::record_received(event.kind.as_str());
    Ok(event)
}

/// Decode one event as published on a drop channel or stored in a snapshot.
pub(crate) fn decode_event(payload: &str) -> Result<DropSyncEvent, SyncError> {
    serde_json::from_str(payload).map_err(|e| {
        tracing::warn!(error = %e, "Failed to decode drop event");
        SyncError::Serialization(e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use flashdrop_core::queue::DropQueue;

    #[test]
    fn decodes_published_payloads() {
        let queue = DropQueue::new(DropId::new("d1"), 3, Utc::now());
        let event = DropSyncEvent::queue_update(&queue, vec![]);
        let payload = serde_json::to_string(&event).unwrap_or_default();

        assert_eq!(decode_event(&payload), Ok(event));
    }

    #[test]
    fn garbage_payloads_are_serialization_errors() {
        assert!(matches!(
            decode_event("{\"not\":\"an event\"}"),
            Err(SyncError::Serialization(_))
        ));
    }
}
