//! # Flashdrop Testing
//!
//! Test doubles for the drop services.
//!
//! This crate provides:
//! - Controllable clocks
//! - In-memory implementations of every store trait, with fault injection
//! - An in-memory sync bus and snapshot store
//! - Catalog, order and alert doubles that record what they were asked
//!
//! ## Example
//!
//! ```
//! use flashdrop_testing::{MockClock, test_clock};
//! use flashdrop_core::environment::Clock;
//!
//! let clock = MockClock::new(test_clock().now());
//! let before = clock.now();
//! clock.advance(chrono::Duration::seconds(2));
//! assert_eq!(clock.now() - before, chrono::Duration::seconds(2));
//! ```

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity
#![allow(clippy::missing_panics_doc)]

use chrono::{DateTime, Utc};
use flashdrop_core::environment::Clock;

/// In-memory stock, reservation and queue stores
pub mod stores;

/// In-memory sync bus and snapshot store
pub mod sync;

/// Catalog, order service and alert sink doubles
pub mod collaborators;

/// Mock implementations of environment traits
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use std::sync::{Arc, RwLock};

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time.
    ///
    /// ```
    /// use flashdrop_testing::mocks::FixedClock;
    /// use flashdrop_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Clock that only moves when told to.
    ///
    /// Clones share the same time, so a test can keep one handle and give
    /// another to the services under test.
    #[derive(Debug, Clone)]
    pub struct MockClock {
        time: Arc<RwLock<DateTime<Utc>>>,
    }

    impl MockClock {
        /// Create a clock starting at `start`
        #[must_use]
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                time: Arc::new(RwLock::new(start)),
            }
        }

        /// Move time forward
        pub fn advance(&self, by: chrono::Duration) {
            let mut time = self.time.write().unwrap();
            *time += by;
        }

        /// Jump to an absolute time
        pub fn set(&self, to: DateTime<Utc>) {
            *self.time.write().unwrap() = to;
        }
    }

    impl Clock for MockClock {
        fn now(&self) -> DateTime<Utc> {
            *self.time.read().unwrap()
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    #[must_use]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        )
    }
}

/// Test helpers
pub mod helpers {
    use std::sync::Once;

    static INIT: Once = Once::new();

    /// Install a `tracing` subscriber that writes to the test harness.
    ///
    /// Honors `RUST_LOG`; safe to call from every test.
    pub fn init_test_tracing() {
        INIT.call_once(|| {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
                )
                .with_test_writer()
                .try_init();
        });
    }
}

// Re-export commonly used items
pub use collaborators::{RecordingAlertSink, RecordingOrderService, StaticCatalog};
pub use helpers::init_test_tracing;
pub use mocks::{FixedClock, MockClock, test_clock};
pub use stores::{InMemoryQueueStore, InMemoryReservationStore, InMemoryStockStore, StoreFaults};
pub use sync::{InMemorySnapshotStore, InMemorySyncBus};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_clock_never_moves() {
        let clock = test_clock();
        assert_eq!(clock.now(), clock.now());
    }

    #[test]
    fn mock_clock_clones_share_time() {
        let clock = MockClock::new(test_clock().now());
        let handle = clock.clone();
        handle.advance(chrono::Duration::minutes(15));
        assert_eq!(clock.now(), test_clock().now() + chrono::Duration::minutes(15));
    }
}
