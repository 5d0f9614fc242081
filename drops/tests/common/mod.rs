//! Shared in-memory wiring for the drop service integration tests.

#![allow(dead_code, clippy::unwrap_used)]

use drops::config::Config;
use drops::{DropEnvironment, DropServices};
use flashdrop_core::environment::Clock;
use flashdrop_core::reservation::ReservationStatus;
use flashdrop_core::stock::StockRecord;
use flashdrop_core::types::ProductId;
use flashdrop_testing::{
    InMemoryQueueStore, InMemoryReservationStore, InMemorySnapshotStore, InMemoryStockStore,
    InMemorySyncBus, MockClock, RecordingAlertSink, RecordingOrderService, StaticCatalog,
    test_clock,
};
use std::sync::Arc;

/// One replica over in-memory backends, with handles to inspect them.
pub struct TestDrop {
    pub services: DropServices,
    pub clock: MockClock,
    pub stocks: InMemoryStockStore,
    pub reservations: InMemoryReservationStore,
    pub queues: InMemoryQueueStore,
    pub bus: InMemorySyncBus,
    pub snapshots: InMemorySnapshotStore,
    pub catalog: StaticCatalog,
    pub orders: RecordingOrderService,
    pub alerts: RecordingAlertSink,
}

impl TestDrop {
    /// Drop `d1` selling `sku-1` (5 units) and `sku-2` (100 units).
    pub fn new() -> Self {
        Self::with_config(&Config::default())
    }

    pub fn with_config(config: &Config) -> Self {
        let catalog = StaticCatalog::new()
            .with_product("sku-1", "d1", 5, 1)
            .with_product("sku-2", "d1", 100, 10);
        Self::with_catalog(config, catalog)
    }

    pub fn with_catalog(config: &Config, catalog: StaticCatalog) -> Self {
        let clock = MockClock::new(test_clock().now());
        let stocks = InMemoryStockStore::new();
        let reservations = InMemoryReservationStore::new();
        let queues = InMemoryQueueStore::new();
        let bus = InMemorySyncBus::new();
        let snapshots = InMemorySnapshotStore::new();
        let orders = RecordingOrderService::new();
        let alerts = RecordingAlertSink::new();

        let env = DropEnvironment {
            stocks: Arc::new(stocks.clone()),
            reservations: Arc::new(reservations.clone()),
            queues: Arc::new(queues.clone()),
            bus: Arc::new(bus.clone()),
            snapshots: Arc::new(snapshots.clone()),
            catalog: Arc::new(catalog.clone()),
            orders: Arc::new(orders.clone()),
            alerts: Arc::new(alerts.clone()),
            clock: Arc::new(clock.clone()),
        };
        let services = DropServices::build(env, config);

        Self {
            services,
            clock,
            stocks,
            reservations,
            queues,
            bus,
            snapshots,
            catalog,
            orders,
            alerts,
        }
    }

    pub fn stock(&self, product: &str) -> StockRecord {
        self.stocks.peek(&ProductId::new(product)).unwrap()
    }

    pub fn available(&self, product: &str) -> u32 {
        self.stock(product).available()
    }

    /// `reserved` must always equal the units held by active reservations.
    pub fn assert_ledger_matches_reservations(&self, product: &str) {
        let record = self.stock(product);
        let held = self.reservations.active_units(&ProductId::new(product));
        assert!(record.is_consistent(), "reserved exceeds quantity: {record:?}");
        assert_eq!(record.reserved, held, "ledger and reservations disagree for {product}");
    }

    pub fn count_with_status(&self, status: ReservationStatus) -> usize {
        self.reservations.all().iter().filter(|r| r.status == status).count()
    }

    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }
}
