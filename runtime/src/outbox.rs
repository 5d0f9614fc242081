//! Bounded in-process outbox for work that must be retried later.
//!
//! The sync fabric parks events here when a publish fails; the relay drains
//! the outbox on an interval and parks whatever still fails. When the outbox
//! is full the oldest entry is dropped: a later state event for the same key
//! supersedes it, and subscribers reconcile from the snapshot anyway.

use crate::metrics::OutboxMetrics;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// A parked item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboxEntry<T> {
    /// The parked payload
    pub payload: T,
    /// Delivery attempts so far
    pub attempts: u32,
    /// Error from the last attempt
    pub last_error: String,
    /// When the item was first parked
    pub first_parked_at: DateTime<Utc>,
    /// When the item was last parked
    pub last_parked_at: DateTime<Utc>,
}

/// Bounded FIFO of parked items. Clones share the same buffer.
#[derive(Debug)]
pub struct Outbox<T> {
    name: &'static str,
    entries: Arc<Mutex<VecDeque<OutboxEntry<T>>>>,
    capacity: usize,
}

impl<T> Outbox<T> {
    /// Create an outbox holding at most `capacity` items (minimum 1).
    #[must_use]
    pub fn new(name: &'static str, capacity: usize) -> Self {
        Self {
            name,
            entries: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<OutboxEntry<T>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Park a payload after its first failed attempt.
    pub fn park(&self, payload: T, error: impl Into<String>, now: DateTime<Utc>) {
        self.push(OutboxEntry {
            payload,
            attempts: 1,
            last_error: error.into(),
            first_parked_at: now,
            last_parked_at: now,
        });
    }

    /// Put back an entry whose retry failed again.
    pub fn repark(&self, mut entry: OutboxEntry<T>, error: impl Into<String>, now: DateTime<Utc>) {
        entry.attempts = entry.attempts.saturating_add(1);
        entry.last_error = error.into();
        entry.last_parked_at = now;
        self.push(entry);
    }

    fn push(&self, entry: OutboxEntry<T>) {
        let mut entries = self.lock();
        if entries.len() >= self.capacity {
            entries.pop_front();
            OutboxMetrics::record_dropped(self.name);
            tracing::warn!(
                outbox = self.name,
                capacity = self.capacity,
                "Outbox full, dropping oldest entry"
            );
        }
        tracing::debug!(
            outbox = self.name,
            attempts = entry.attempts,
            error = %entry.last_error,
            "Parked in outbox"
        );
        entries.push_back(entry);
        OutboxMetrics::record_parked(self.name);
        OutboxMetrics::record_size(self.name, entries.len());
    }

    /// Remove and return every parked entry, oldest first.
    pub fn drain(&self) -> Vec<OutboxEntry<T>> {
        let mut entries = self.lock();
        let drained: Vec<_> = entries.drain(..).collect();
        OutboxMetrics::record_size(self.name, 0);
        drained
    }

    /// Number of parked entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// When the oldest parked entry was first parked.
    #[must_use]
    pub fn oldest_parked_at(&self) -> Option<DateTime<Utc>> {
        self.lock().front().map(|e| e.first_parked_at)
    }

    /// Maximum number of entries.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Name used in logs and metrics.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for Outbox<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            entries: Arc::clone(&self.entries),
            capacity: self.capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_outbox_drops_the_oldest_entry() {
        let outbox = Outbox::new("test", 2);
        let now = Utc::now();
        outbox.park(1, "down", now);
        outbox.park(2, "down", now);
        outbox.park(3, "down", now);

        let payloads: Vec<_> = outbox.drain().into_iter().map(|e| e.payload).collect();
        assert_eq!(payloads, vec![2, 3]);
        assert!(outbox.is_empty());
    }

    #[test]
    fn repark_counts_attempts_and_keeps_first_time() {
        let outbox = Outbox::new("test", 4);
        let first = Utc::now();
        outbox.park("event", "timeout", first);

        let later = first + chrono::Duration::seconds(5);
        for entry in outbox.drain() {
            outbox.repark(entry, "refused", later);
        }

        let entries = outbox.drain();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].attempts, 2);
        assert_eq!(entries[0].last_error, "refused");
        assert_eq!(entries[0].first_parked_at, first);
        assert_eq!(entries[0].last_parked_at, later);
    }

    #[test]
    fn clones_share_entries() {
        let outbox = Outbox::new("test", 4);
        let clone = outbox.clone();
        clone.park((), "x", Utc::now());
        assert_eq!(outbox.len(), 1);
        assert!(outbox.oldest_parked_at().is_some());
    }
}
