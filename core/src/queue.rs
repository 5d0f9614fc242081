//! Per-drop admission queue.
//!
//! [`DropQueue`] is the whole admission state of one drop: the shoppers
//! currently allowed to shop (`active`) and a strict FIFO line of everyone
//! else (`waiting`). Its methods are pure; the admission controller loads a
//! queue, mutates it, and writes it back with a compare-and-swap on
//! `revision`.
//!
//! # Invariants
//!
//! - `active.len() <= max_concurrent_users`, so the bound can never be set
//!   below the number of shoppers already admitted
//! - a user appears at most once across `active` and `waiting`
//! - promotion always takes the head of `waiting`

use crate::error::DropError;
use crate::types::{DropId, SessionId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// A shopper currently admitted to the drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveEntry {
    /// The admitted shopper
    pub user_id: UserId,
    /// Cart whose holds end with the shopping window
    pub session_id: SessionId,
    /// When the shopper was admitted (starts the shopping window)
    pub admitted_at: DateTime<Utc>,
    /// When the shopper first joined
    pub joined_at: DateTime<Utc>,
}

/// A shopper waiting for a slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingEntry {
    /// The waiting shopper
    pub user_id: UserId,
    /// Cart the shopper will shop with once admitted
    pub session_id: SessionId,
    /// When the shopper joined the line
    pub joined_at: DateTime<Utc>,
}

/// Queue entry state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    /// In line
    Waiting,
    /// Admitted
    Active,
}

/// Flat view of one shopper's place in a drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    /// Drop the entry belongs to
    pub drop_id: DropId,
    /// The shopper
    pub user_id: UserId,
    /// Waiting or active
    pub state: QueueState,
    /// When the shopper joined
    pub joined_at: DateTime<Utc>,
}

/// Where a shopper stands.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum QueuePosition {
    /// Admitted and free to shop
    Active {
        /// Start of the shopping window
        admitted_at: DateTime<Utc>,
    },
    /// In line at a 1-based position
    Waiting {
        /// 1 = next to be promoted
        position: u32,
    },
    /// Not present in this drop
    NotQueued,
}

/// Outcome of [`DropQueue::join`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Resulting position of the joining user
    pub position: QueuePosition,
    /// Whether the queue was modified (false for a repeat join)
    pub changed: bool,
}

/// Outcome of [`DropQueue::leave`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LeaveOutcome {
    /// Where the user was removed from, if present
    pub removed_from: Option<QueueState>,
    /// Users promoted into the freed slots, in promotion order
    pub promoted: Vec<UserId>,
}

impl LeaveOutcome {
    /// Whether the queue was modified.
    #[must_use]
    pub const fn changed(&self) -> bool {
        self.removed_from.is_some()
    }
}

/// Admission state for one drop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropQueue {
    /// Drop identity
    pub drop_id: DropId,
    /// Upper bound on `active`
    pub max_concurrent_users: u32,
    /// Admitted shoppers in admission order
    pub active: Vec<ActiveEntry>,
    /// FIFO line
    pub waiting: VecDeque<WaitingEntry>,
    /// Incremented by one on every change
    pub revision: u64,
    /// Time of the last change
    pub updated_at: DateTime<Utc>,
}

impl DropQueue {
    /// Create an empty queue.
    #[must_use]
    pub const fn new(drop_id: DropId, max_concurrent_users: u32, now: DateTime<Utc>) -> Self {
        Self {
            drop_id,
            max_concurrent_users,
            active: Vec::new(),
            waiting: VecDeque::new(),
            revision: 0,
            updated_at: now,
        }
    }

    /// Number of admitted shoppers.
    #[must_use]
    pub fn active_count(&self) -> u32 {
        u32::try_from(self.active.len()).unwrap_or(u32::MAX)
    }

    /// Number of waiting shoppers.
    #[must_use]
    pub fn waiting_count(&self) -> u32 {
        u32::try_from(self.waiting.len()).unwrap_or(u32::MAX)
    }

    /// Whether a slot is free.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.active_count() < self.max_concurrent_users
    }

    /// Current position of a user.
    #[must_use]
    pub fn position_of(&self, user_id: &UserId) -> QueuePosition {
        if let Some(entry) = self.active.iter().find(|e| &e.user_id == user_id) {
            return QueuePosition::Active {
                admitted_at: entry.admitted_at,
            };
        }
        self.waiting
            .iter()
            .position(|e| &e.user_id == user_id)
            .map_or(QueuePosition::NotQueued, |index| QueuePosition::Waiting {
                position: u32::try_from(index + 1).unwrap_or(u32::MAX),
            })
    }

    /// Flat entry for a user, if present.
    #[must_use]
    pub fn entry_of(&self, user_id: &UserId) -> Option<QueueEntry> {
        if let Some(entry) = self.active.iter().find(|e| &e.user_id == user_id) {
            return Some(QueueEntry {
                drop_id: self.drop_id.clone(),
                user_id: user_id.clone(),
                state: QueueState::Active,
                joined_at: entry.joined_at,
            });
        }
        self.waiting
            .iter()
            .find(|e| &e.user_id == user_id)
            .map(|entry| QueueEntry {
                drop_id: self.drop_id.clone(),
                user_id: user_id.clone(),
                state: QueueState::Waiting,
                joined_at: entry.joined_at,
            })
    }

    /// Admit a user if a slot is free, otherwise append to the line.
    ///
    /// Joining again while present is a no-op that reports the current position.
    pub fn join(&mut self, user_id: UserId, session_id: SessionId, now: DateTime<Utc>) -> JoinOutcome {
        let current = self.position_of(&user_id);
        if current != QueuePosition::NotQueued {
            return JoinOutcome {
                position: current,
                changed: false,
            };
        }

        let position = if self.has_capacity() && self.waiting.is_empty() {
            self.active.push(ActiveEntry {
                user_id,
                session_id,
                admitted_at: now,
                joined_at: now,
            });
            QueuePosition::Active { admitted_at: now }
        } else {
            self.waiting.push_back(WaitingEntry {
                user_id,
                session_id,
                joined_at: now,
            });
            QueuePosition::Waiting {
                position: self.waiting_count(),
            }
        };

        self.touch(now);
        JoinOutcome {
            position,
            changed: true,
        }
    }

    /// Remove a user from wherever they are and fill any freed slot.
    pub fn leave(&mut self, user_id: &UserId, now: DateTime<Utc>) -> LeaveOutcome {
        let removed_from = if let Some(index) = self.active.iter().position(|e| &e.user_id == user_id)
        {
            self.active.remove(index);
            Some(QueueState::Active)
        } else if let Some(index) = self.waiting.iter().position(|e| &e.user_id == user_id) {
            self.waiting.remove(index);
            Some(QueueState::Waiting)
        } else {
            None
        };

        if removed_from.is_none() {
            return LeaveOutcome::default();
        }

        let promoted = self.promote(now);
        self.touch(now);
        LeaveOutcome {
            removed_from,
            promoted,
        }
    }

    /// Change the bound. Raising it promotes waiting users immediately.
    ///
    /// # Errors
    ///
    /// - [`DropError::InvalidRequest`] for a bound of zero
    /// - [`DropError::InvalidState`] for a bound below the number of shoppers
    ///   already admitted; they have to leave first
    pub fn set_capacity(
        &mut self,
        max_concurrent_users: u32,
        now: DateTime<Utc>,
    ) -> Result<Vec<UserId>, DropError> {
        if max_concurrent_users == 0 {
            return Err(DropError::InvalidRequest(
                "max_concurrent_users must be at least 1".into(),
            ));
        }
        if max_concurrent_users < self.active_count() {
            return Err(DropError::InvalidState(format!(
                "drop {} has {} active shoppers, cannot lower the bound to {max_concurrent_users}",
                self.drop_id,
                self.active_count()
            )));
        }
        if max_concurrent_users == self.max_concurrent_users {
            return Ok(Vec::new());
        }
        self.max_concurrent_users = max_concurrent_users;
        let promoted = self.promote(now);
        self.touch(now);
        Ok(promoted)
    }

    /// Active entries whose shopping window has elapsed, in admission order.
    #[must_use]
    pub fn overstayed(&self, now: DateTime<Utc>, window: chrono::Duration) -> Vec<ActiveEntry> {
        self.active
            .iter()
            .filter(|e| now - e.admitted_at >= window)
            .cloned()
            .collect()
    }

    fn promote(&mut self, now: DateTime<Utc>) -> Vec<UserId> {
        let mut promoted = Vec::new();
        while self.has_capacity() {
            let Some(next) = self.waiting.pop_front() else {
                break;
            };
            promoted.push(next.user_id.clone());
            self.active.push(ActiveEntry {
                user_id: next.user_id,
                session_id: next.session_id,
                admitted_at: now,
                joined_at: next.joined_at,
            });
        }
        promoted
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.revision += 1;
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn user(name: &str) -> UserId {
        UserId::new(name)
    }

    fn cart(name: &str) -> SessionId {
        SessionId::new(format!("{name}-cart"))
    }

    #[test]
    fn third_join_waits_and_is_promoted_on_leave() {
        let now = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 2, now);

        assert!(matches!(queue.join(user("a"), cart("a"), now).position, QueuePosition::Active { .. }));
        assert!(matches!(queue.join(user("b"), cart("b"), now).position, QueuePosition::Active { .. }));
        assert_eq!(
            queue.join(user("c"), cart("c"), now).position,
            QueuePosition::Waiting { position: 1 }
        );

        let outcome = queue.leave(&user("a"), now);
        assert_eq!(outcome.removed_from, Some(QueueState::Active));
        assert_eq!(outcome.promoted, vec![user("c")]);
        assert!(matches!(queue.position_of(&user("c")), QueuePosition::Active { .. }));
    }

    #[test]
    fn promotion_is_fifo() {
        let now = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 1, now);
        queue.join(user("x"), cart("x"), now);
        queue.join(user("a"), cart("a"), now);
        queue.join(user("b"), cart("b"), now);

        assert_eq!(queue.leave(&user("x"), now).promoted, vec![user("a")]);
        assert_eq!(queue.leave(&user("a"), now).promoted, vec![user("b")]);
    }

    #[test]
    fn repeat_join_is_idempotent() {
        let now = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 1, now);
        queue.join(user("a"), cart("a"), now);
        let revision = queue.revision;
        let again = queue.join(user("a"), cart("a"), now);
        assert!(!again.changed);
        assert_eq!(queue.revision, revision);
    }

    #[test]
    fn leaving_the_line_does_not_promote() {
        let now = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 1, now);
        queue.join(user("a"), cart("a"), now);
        queue.join(user("b"), cart("b"), now);
        queue.join(user("c"), cart("c"), now);

        let outcome = queue.leave(&user("b"), now);
        assert_eq!(outcome.removed_from, Some(QueueState::Waiting));
        assert!(outcome.promoted.is_empty());
        assert_eq!(queue.position_of(&user("c")), QueuePosition::Waiting { position: 1 });
    }

    #[test]
    fn raising_capacity_promotes_waiting_users() {
        let now = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 1, now);
        queue.join(user("a"), cart("a"), now);
        queue.join(user("b"), cart("b"), now);
        queue.join(user("c"), cart("c"), now);

        assert_eq!(queue.set_capacity(3, now), Ok(vec![user("b"), user("c")]));
        assert!(queue.waiting.is_empty());
        assert_eq!(queue.active[2].session_id, cart("c"));
    }

    #[test]
    fn bound_cannot_drop_below_admitted_shoppers() {
        let now = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 3, now);
        for name in ["a", "b", "c"] {
            queue.join(user(name), cart(name), now);
        }
        let revision = queue.revision;

        assert!(matches!(queue.set_capacity(1, now), Err(DropError::InvalidState(_))));
        assert!(matches!(queue.set_capacity(0, now), Err(DropError::InvalidRequest(_))));
        assert_eq!((queue.max_concurrent_users, queue.revision), (3, revision));

        queue.leave(&user("a"), now);
        queue.leave(&user("b"), now);
        assert_eq!(queue.set_capacity(1, now), Ok(Vec::new()));
        assert_eq!(queue.max_concurrent_users, 1);
    }

    #[test]
    fn overstayed_uses_admission_time() {
        let start = Utc::now();
        let mut queue = DropQueue::new(DropId::new("d1"), 2, start);
        queue.join(user("a"), cart("a"), start);
        queue.join(user("b"), cart("b"), start + chrono::Duration::minutes(5));

        let late = start + chrono::Duration::minutes(10);
        let overstayed = queue.overstayed(late, chrono::Duration::minutes(10));
        assert_eq!(overstayed.len(), 1);
        assert_eq!((&overstayed[0].user_id, &overstayed[0].session_id), (&user("a"), &cart("a")));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Join(u8),
        Leave(u8),
        Resize(u32),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0u8..8).prop_map(Op::Join),
            3 => (0u8..8).prop_map(Op::Leave),
            1 => (0u32..6).prop_map(Op::Resize),
        ]
    }

    proptest! {
        #[test]
        fn active_never_exceeds_capacity(
            capacity in 1u32..5,
            ops in proptest::collection::vec(op_strategy(), 0..100),
        ) {
            let now = Utc::now();
            let mut queue = DropQueue::new(DropId::new("d"), capacity, now);
            for op in ops {
                match op {
                    Op::Join(who) => {
                        queue.join(UserId::new(format!("u{who}")), SessionId::new(format!("s{who}")), now);
                    }
                    Op::Leave(who) => {
                        queue.leave(&UserId::new(format!("u{who}")), now);
                    }
                    Op::Resize(bound) => {
                        let before = queue.max_concurrent_users;
                        if queue.set_capacity(bound, now).is_err() {
                            prop_assert_eq!(queue.max_concurrent_users, before);
                        }
                    }
                }
                prop_assert!(queue.active_count() <= queue.max_concurrent_users);
                if queue.has_capacity() {
                    prop_assert!(queue.waiting.is_empty());
                }
            }
        }
    }
}
