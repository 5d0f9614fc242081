//! Flash-sale drops: stock, reservations, admission and live sync.
//!
//! A drop is a time-boxed sale of a fixed catalog. Thousands of shoppers hit
//! the same few products at once, so the service is built around one rule:
//! the stock record of a product is the only shared mutable state, and it is
//! only ever written through [`StockLedger::apply`] as a compare-and-swap.
//!
//! # Architecture
//!
//! ```text
//!                  ┌─────────────────────┐
//!   storefront ──► │ AdmissionController │──── queue-update ───┐
//!                  └─────────────────────┘                     │
//!                  ┌─────────────────────┐                     ▼
//!   storefront ──► │ ReservationManager  │              ┌────────────┐
//!   payments   ──► │   (+ Reaper)        │              │ SyncFabric │──► replicas / gateway
//!                  └──────────┬──────────┘              └────────────┘
//!                             ▼                                ▲
//!                  ┌─────────────────────┐                     │
//!                  │     StockLedger     │──── stock-update ───┘
//!                  └─────────────────────┘
//! ```
//!
//! - [`ledger`]: `(quantity, reserved)` per product; `available = quantity - reserved`
//! - [`reservation`]: `active → confirmed | cancelled | expired`, exactly one stock effect each
//! - [`reaper`]: expires lapsed holds (status reads never do)
//! - [`admission`]: bounded `active` set plus a FIFO line per drop
//! - [`session`]: ends shopping windows server-side so queue slots are not held forever
//! - [`payment`]: confirms or cancels an order's holds on the payment signal
//! - [`sync`]: snapshot + pub/sub fan-out with per-key version gating
//!
//! Stores, buses and collaborators are injected through [`DropEnvironment`];
//! [`DropApp`] wires the `PostgreSQL` + Redis production stack.

#![forbid(unsafe_code)]

/// Queue admission controller
pub mod admission;

/// Service wiring and lifecycle
pub mod app;

/// HTTP collaborator clients
pub mod collaborators;

/// Configuration management
pub mod config;

/// Store round-trip budgets
pub mod deadline;

/// Stock ledger
pub mod ledger;

/// Business metrics
pub mod metrics;

/// Payment settlement
pub mod payment;

/// Reservation reaper
pub mod reaper;

/// Reservation manager
pub mod reservation;

/// Shopping sessions and window sweeps
pub mod session;

/// Sync fabric
pub mod sync;

#[cfg(test)]
mod fixtures;

pub use admission::{AdmissionController, QueueTicket};
pub use app::{AppError, BackgroundTasks, DropApp, DropEnvironment, DropServices};
pub use config::{Config, ConfigError};
pub use ledger::{AdjustmentOutcome, StockAdjustment, StockLedger};
pub use payment::{PaymentSettlement, SettlementOutcome};
pub use reaper::{ReapReport, ReservationReaper};
pub use reservation::{CreateReservation, ReservationManager};
pub use session::{SessionEnd, SessionSweeper, ShoppingSessions};
pub use sync::{FlushReport, GatedStream, SyncFabric, SyncHandler};
