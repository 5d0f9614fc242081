//! Redis sync fabric for flash-sale drops.
//!
//! This crate provides a Redis-backed implementation of the
//! [`SyncBus`](flashdrop_core::sync::SyncBus) and
//! [`SnapshotStore`](flashdrop_core::sync::SnapshotStore) traits:
//!
//! - live deltas go over Redis pub/sub, one channel per drop (`drop:{drop_id}`)
//! - latest state per `(drop, key)` lives in two hashes per drop, written by a
//!   Lua script that only replaces an entry with a newer revision
//!
//! # Delivery
//!
//! Redis pub/sub is fire-and-forget: a subscriber that is disconnected misses
//! whatever was published meanwhile. The snapshot hash closes that gap, since
//! a reconnecting subscriber attaches to the channel first and then reads the
//! snapshot, discarding anything it already applied.
//!
//! # Example
//!
//! ```no_run
//! use flashdrop_redis::RedisSyncBus;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let bus = RedisSyncBus::builder()
//!     .url("redis://localhost:6379")
//!     .key_prefix("prod:")
//!     .build()
//!     .await?;
//!
//! let snapshots = bus.snapshot_store(Some(Duration::from_secs(86_400)));
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod bus;
mod snapshot;

pub use bus::{RedisSyncBus, RedisSyncBusBuilder};
pub use snapshot::RedisSnapshotStore;

use flashdrop_core::sync::SyncError;

/// Map a connection-level Redis error.
fn connection_error(err: &redis::RedisError) -> SyncError {
    SyncError::ConnectionFailed(err.to_string())
}

/// Map a Redis error raised while reading or writing snapshots.
fn snapshot_error(err: &redis::RedisError) -> SyncError {
    if err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        SyncError::ConnectionFailed(err.to_string())
    } else {
        SyncError::Snapshot(err.to_string())
    }
}
