//! # Flashdrop Core
//!
//! Core types and traits for running flash-sale drops.
//!
//! This crate holds everything that does not perform I/O: the identifiers, the
//! stock and reservation records, the pure admission-queue state machine, the
//! real-time sync event model, and the traits that storage, pub/sub and
//! collaborator implementations plug into.
//!
//! ## Core Concepts
//!
//! - **Stock record**: `(quantity, reserved)` per product, `available` is derived
//! - **Reservation**: a time-boxed hold on stock, `active → confirmed | cancelled | expired`
//! - **Drop queue**: bounded set of active shoppers plus a FIFO waiting line
//! - **Sync event**: a revisioned `stock-update` / `queue-update` broadcast per drop
//! - **Environment**: stores, buses and clocks injected as `Arc<dyn Trait>`
//!
//! ## Architecture Principles
//!
//! - Pure transitions (`StockRecord::apply_delta`, `DropQueue::join`) live here
//! - Atomicity comes from the stores: every write is a compare-and-swap on a revision
//! - Traits return boxed futures so they can be used as trait objects
//!
//! ## Example
//!
//! ```
//! use flashdrop_core::stock::{StockDelta, StockRecord};
//! use flashdrop_core::types::{DropId, ProductId, SellerId};
//! use chrono::Utc;
//!
//! let record = StockRecord::new(
//!     ProductId::new("sneaker-42"),
//!     SellerId::new("acme"),
//!     DropId::new("summer-drop"),
//!     5,
//!     1,
//!     Utc::now(),
//! );
//!
//! let (held, _crossing) = record
//!     .apply_delta(&StockDelta::reserve(2), Utc::now())
//!     .expect("2 of 5 units are free");
//! assert_eq!(held.available(), 3);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Collaborator seams (catalog, orders, alerts)
pub mod collaborators;

/// Error taxonomy shared by every drop service
pub mod error;

/// Per-drop admission queue state machine
pub mod queue;

/// Reservation records and lifecycle
pub mod reservation;

/// Stock records and the ledger transition
pub mod stock;

/// Storage traits
pub mod store;

/// Real-time sync events and pub/sub traits
pub mod sync;

/// Identifier newtypes
pub mod types;

/// Environment module - Dependency injection traits
///
/// All time-dependent logic reads the clock through this trait so tests can
/// move time forward deterministically.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use flashdrop_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

pub use error::{DropError, Result};
