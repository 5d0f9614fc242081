//! Sync fabric behavior between replicas sharing one bus and snapshot store.

#![allow(clippy::unwrap_used)]

mod common;

use common::TestDrop;
use drops::config::{Config, SyncConfig};
use drops::{CreateReservation, SyncFabric};
use flashdrop_core::stock::StockRecord;
use flashdrop_core::sync::{DropSyncEvent, SyncEventKind, SyncPayload};
use flashdrop_core::types::{DropId, ProductId, SellerId};
use flashdrop_testing::test_clock;
use futures::StreamExt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

fn stock_event(revision: u64, reserved: u32) -> DropSyncEvent {
    let mut record = StockRecord::new(
        ProductId::new("sku-1"),
        SellerId::new("seller-1"),
        DropId::new("d1"),
        5,
        1,
        chrono::Utc::now(),
    );
    record.revision = revision;
    record.reserved = reserved;
    DropSyncEvent::stock_update(&record)
}

/// A second replica wired to the same bus and snapshots as `drop`.
fn peer(drop: &TestDrop) -> SyncFabric {
    SyncFabric::new(
        Arc::new(drop.bus.clone()),
        Arc::new(drop.snapshots.clone()),
        Arc::new(test_clock()),
        SyncConfig::default(),
    )
}

fn available_in(event: &DropSyncEvent) -> Option<u32> {
    match event.payload {
        SyncPayload::Stock { available, .. } => Some(available),
        SyncPayload::Queue { .. } => None,
    }
}

#[tokio::test]
async fn late_subscriber_gets_snapshot_then_live_events() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services
        .reservations
        .create(CreateReservation::new("sku-1", 2, "s1"))
        .await
        .unwrap();

    let mut events = peer(&drop).subscribe(&d1).await.unwrap();
    let bootstrap = events.next().await.unwrap();
    assert_eq!(bootstrap.kind, SyncEventKind::StockUpdate);
    assert_eq!(available_in(&bootstrap), Some(3));

    drop.services
        .reservations
        .create(CreateReservation::new("sku-1", 1, "s2"))
        .await
        .unwrap();
    let live = tokio::time::timeout(Duration::from_secs(1), events.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(available_in(&live), Some(2));
    assert!(live.revision > bootstrap.revision);
}

#[tokio::test]
async fn stale_and_duplicate_events_never_reach_subscribers() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    let fabric = peer(&drop);
    let mut events = fabric.subscribe(&d1).await.unwrap();

    fabric.publish(&stock_event(3, 2)).await.unwrap();
    fabric.publish(&stock_event(2, 1)).await.unwrap();
    fabric.publish(&stock_event(3, 2)).await.unwrap();
    fabric.publish(&stock_event(4, 0)).await.unwrap();

    let first = events.next().await.unwrap();
    let second = events.next().await.unwrap();
    assert_eq!((first.revision, second.revision), (3, 4));

    let snapshot = fabric.snapshot(&d1).await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].revision, 4);
}

#[tokio::test]
async fn bus_outage_never_fails_the_reservation() {
    let drop = TestDrop::new();
    drop.bus.set_failing(true);

    let held = drop
        .services
        .reservations
        .create(CreateReservation::new("sku-1", 1, "s1"))
        .await
        .unwrap();
    assert!(held.is_active());
    assert_eq!(drop.services.sync.parked(), 1);
    assert!(drop.bus.published().is_empty());

    drop.bus.set_failing(false);
    let report = drop.services.sync.flush_outbox().await;
    assert_eq!(report.delivered, 1);
    assert_eq!(drop.bus.published().len(), 1);
    assert_eq!(drop.services.sync.parked(), 0);
}

#[tokio::test]
async fn relay_delivers_parked_events_on_shutdown() {
    let config = Config {
        sync: SyncConfig {
            relay_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        },
        ..Config::default()
    };
    let drop = TestDrop::with_config(&config);
    drop.bus.set_failing(true);
    drop.services
        .reservations
        .create(CreateReservation::new("sku-2", 1, "s1"))
        .await
        .unwrap();
    drop.bus.set_failing(false);

    let (shutdown, _) = broadcast::channel(1);
    let relay = tokio::spawn(drop.services.sync.clone().run_relay(shutdown.subscribe()));
    shutdown.send(()).unwrap();
    relay.await.unwrap();

    assert_eq!(drop.services.sync.parked(), 0);
    assert_eq!(drop.bus.published().len(), 1);
}

#[tokio::test]
async fn spawned_subscriber_feeds_a_closure_handler() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handler = move |event: DropSyncEvent| sink.lock().unwrap().push(event.revision);

    let (shutdown, _) = broadcast::channel(1);
    let task = peer(&drop).spawn_subscriber(d1.clone(), Arc::new(handler), shutdown.subscribe());

    // Wait until the subscription is attached before mutating.
    for _ in 0..50 {
        if drop.bus.receiver_count(&d1).await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for i in 0..3 {
        drop.services
            .reservations
            .create(CreateReservation::new("sku-2", 1, format!("s{i}")))
            .await
            .unwrap();
    }

    for _ in 0..50 {
        if seen.lock().unwrap().len() == 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    shutdown.send(()).unwrap();
    task.await.unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3]);
}
