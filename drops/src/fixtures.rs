//! In-memory wiring shared by the unit tests.

#![allow(clippy::unwrap_used)]

use crate::app::{DropEnvironment, DropServices};
use crate::config::Config;
use flashdrop_core::environment::Clock;
use flashdrop_core::stock::StockRecord;
use flashdrop_core::types::ProductId;
use flashdrop_testing::{
    InMemoryQueueStore, InMemoryReservationStore, InMemorySnapshotStore, InMemoryStockStore,
    InMemorySyncBus, MockClock, RecordingAlertSink, RecordingOrderService, StaticCatalog,
    test_clock,
};
use std::sync::Arc;

pub(crate) struct Harness {
    pub services: DropServices,
    pub clock: MockClock,
    pub stock_store: InMemoryStockStore,
    pub reservation_store: InMemoryReservationStore,
    pub queue_store: InMemoryQueueStore,
    pub bus: InMemorySyncBus,
    pub orders: RecordingOrderService,
}

impl Harness {
    /// Products `p1` (5 units, threshold 1) and `p2` (50 units, threshold 10) in drop `d1`.
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let clock = MockClock::new(test_clock().now());
        let stock_store = InMemoryStockStore::new();
        let reservation_store = InMemoryReservationStore::new();
        let queue_store = InMemoryQueueStore::new();
        let bus = InMemorySyncBus::new();
        let orders = RecordingOrderService::new();
        let catalog = StaticCatalog::new()
            .with_product("p1", "d1", 5, 1)
            .with_product("p2", "d1", 50, 10);

        let env = DropEnvironment {
            stocks: Arc::new(stock_store.clone()),
            reservations: Arc::new(reservation_store.clone()),
            queues: Arc::new(queue_store.clone()),
            bus: Arc::new(bus.clone()),
            snapshots: Arc::new(InMemorySnapshotStore::new()),
            catalog: Arc::new(catalog),
            orders: Arc::new(orders.clone()),
            alerts: Arc::new(RecordingAlertSink::new()),
            clock: Arc::new(clock.clone()),
        };

        Self {
            services: DropServices::build(env, config),
            clock,
            stock_store,
            reservation_store,
            queue_store,
            bus,
            orders,
        }
    }

    pub fn stock(&self, product: &str) -> StockRecord {
        self.stock_store.peek(&ProductId::new(product)).unwrap()
    }

    pub fn available(&self, product: &str) -> u32 {
        self.stock(product).available()
    }
}
