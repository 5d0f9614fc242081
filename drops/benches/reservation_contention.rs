//! Reservation throughput under contention on a single product.
//!
//! Run with: `cargo bench --bench reservation_contention`

#![allow(missing_docs)]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use drops::config::Config;
use drops::{CreateReservation, DropEnvironment, DropServices};
use flashdrop_core::environment::SystemClock;
use flashdrop_testing::{
    InMemoryQueueStore, InMemoryReservationStore, InMemorySnapshotStore, InMemoryStockStore,
    InMemorySyncBus, RecordingAlertSink, RecordingOrderService, StaticCatalog,
};
use std::sync::Arc;

fn services(units: u32) -> DropServices {
    let env = DropEnvironment {
        stocks: Arc::new(InMemoryStockStore::new()),
        reservations: Arc::new(InMemoryReservationStore::new()),
        queues: Arc::new(InMemoryQueueStore::new()),
        bus: Arc::new(InMemorySyncBus::new()),
        snapshots: Arc::new(InMemorySnapshotStore::new()),
        catalog: Arc::new(StaticCatalog::new().with_product("hot", "d1", units, 0)),
        orders: Arc::new(RecordingOrderService::new()),
        alerts: Arc::new(RecordingAlertSink::new()),
        clock: Arc::new(SystemClock),
    };
    DropServices::build(env, &Config::default())
}

/// One shopper holding and releasing a unit.
fn benchmark_uncontended(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("runtime");
    let services = services(1_000);
    let services = &services;

    let mut group = c.benchmark_group("reservation");
    group.throughput(Throughput::Elements(1));
    group.bench_function("create_then_cancel", |b| {
        b.to_async(&runtime).iter(|| async move {
            let held = services
                .reservations
                .create(CreateReservation::new("hot", 1, "bench"))
                .await
                .unwrap();
            black_box(services.reservations.cancel(held.id).await.unwrap());
        });
    });
    group.finish();
}

/// Many shoppers racing for the same product's compare-and-swap.
fn benchmark_contended(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .expect("runtime");

    let mut group = c.benchmark_group("reservation_contention");
    for shoppers in [4u32, 16, 64] {
        group.throughput(Throughput::Elements(u64::from(shoppers)));
        group.bench_with_input(BenchmarkId::from_parameter(shoppers), &shoppers, |b, &shoppers| {
            b.to_async(&runtime).iter(|| async move {
                // Half the shoppers can be served, so both paths are exercised.
                let services = services(shoppers / 2);
                let mut handles = Vec::with_capacity(shoppers as usize);
                for i in 0..shoppers {
                    let reservations = services.reservations.clone();
                    handles.push(tokio::spawn(async move {
                        reservations
                            .create(CreateReservation::new("hot", 1, format!("s{i}")))
                            .await
                            .is_ok()
                    }));
                }
                let mut won = 0;
                for handle in handles {
                    if handle.await.unwrap() {
                        won += 1;
                    }
                }
                black_box(won);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_uncontended, benchmark_contended);
criterion_main!(benches);
