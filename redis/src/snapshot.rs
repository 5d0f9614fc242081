use crate::bus::decode_event;
use crate::snapshot_error;
use flashdrop_core::sync::{DropSyncEvent, SnapshotStore, SyncError, SyncFuture};
use flashdrop_core::types::DropId;
use redis::aio::ConnectionManager;
use std::collections::HashMap;
use std::time::Duration;

/// Compare-and-set on `(revision, last_updated)` for one snapshot field.
///
/// KEYS: snapshot hash, revisions hash.
/// ARGV: field, revision, last-updated micros, event JSON, ttl seconds (0 = none).
const PUT_IF_NEWER: &str = r"
local current = redis.call('HGET', KEYS[2], ARGV[1])
if current then
    local sep = string.find(current, ':', 1, true)
    local revision = tonumber(string.sub(current, 1, sep - 1))
    local updated = tonumber(string.sub(current, sep + 1))
    local next_revision = tonumber(ARGV[2])
    local next_updated = tonumber(ARGV[3])
    if next_revision < revision or (next_revision == revision and next_updated <= updated) then
        return 0
    end
end
redis.call('HSET', KEYS[2], ARGV[1], ARGV[2] .. ':' .. ARGV[3])
redis.call('HSET', KEYS[1], ARGV[1], ARGV[4])
local ttl = tonumber(ARGV[5])
if ttl > 0 then
    redis.call('EXPIRE', KEYS[1], ttl)
    redis.call('EXPIRE', KEYS[2], ttl)
end
return 1
";

/// Redis hash implementation of [`SnapshotStore`].
///
/// Each drop owns two hashes keyed by event key (`stock:{product_id}` or `queue`):
/// `drop:{id}:snapshot` holds the latest event JSON and `drop:{id}:revisions`
/// holds `revision:micros` for the compare-and-set.
#[derive(Clone)]
pub struct RedisSnapshotStore {
    manager: ConnectionManager,
    key_prefix: String,
    ttl: Option<Duration>,
    script: redis::Script,
}

impl std::fmt::Debug for RedisSnapshotStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSnapshotStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl RedisSnapshotStore {
    pub(crate) fn new(manager: ConnectionManager, key_prefix: String, ttl: Option<Duration>) -> Self {
        Self {
            manager,
            key_prefix,
            ttl,
            script: redis::Script::new(PUT_IF_NEWER),
        }
    }

    fn snapshot_key(&self, drop_id: &DropId) -> String {
        snapshot_key(&self.key_prefix, drop_id)
    }

    fn revisions_key(&self, drop_id: &DropId) -> String {
        revisions_key(&self.key_prefix, drop_id)
    }
}

fn snapshot_key(prefix: &str, drop_id: &DropId) -> String {
    format!("{prefix}drop:{drop_id}:snapshot")
}

fn revisions_key(prefix: &str, drop_id: &DropId) -> String {
    format!("{prefix}drop:{drop_id}:revisions")
}

impl SnapshotStore for RedisSnapshotStore {
    fn put_if_newer(&self, event: &DropSyncEvent) -> SyncFuture<'_, bool> {
        let event = event.clone();
        Box::pin(async move {
            let payload = serde_json::to_string(&event)
                .map_err(|e| SyncError::Serialization(e.to_string()))?;
            let ttl_secs = self.ttl.map_or(0, |ttl| ttl.as_secs().max(1));

            let mut conn = self.manager.clone();
            let written: i64 = self
                .script
                .key(self.snapshot_key(&event.drop_id))
                .key(self.revisions_key(&event.drop_id))
                .arg(&event.key)
                .arg(event.revision)
                .arg(event.last_updated.timestamp_micros())
                .arg(payload)
                .arg(ttl_secs)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| snapshot_error(&e))?;

            if written == 0 {
                tracing::debug!(
                    drop_id = %event.drop_id,
                    key = %event.key,
                    revision = event.revision,
                    "Snapshot already holds a newer revision"
                );
            }
            Ok(written == 1)
        })
    }

    fn snapshot(&self, drop_id: &DropId) -> SyncFuture<'_, Vec<DropSyncEvent>> {
        let key = self.snapshot_key(drop_id);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let entries: HashMap<String, String> = redis::cmd("HGETALL")
                .arg(&key)
                .query_async(&mut conn)
                .await
                .map_err(|e| snapshot_error(&e))?;

            let mut events: Vec<DropSyncEvent> = entries
                .into_iter()
                .filter_map(|(field, payload)| match decode_event(&payload) {
                    Ok(event) => Some(event),
                    Err(e) => {
                        tracing::warn!(key = %key, field = %field, error = %e, "Skipping corrupt snapshot entry");
                        None
                    }
                })
                .collect();
            events.sort_by(|a, b| a.key.cmp(&b.key));
            Ok(events)
        })
    }
}
