//! Checkout: holds attached to an order, then settled or failed by payment.

#![allow(clippy::unwrap_used)]

mod common;

use common::TestDrop;
use drops::CreateReservation;
use flashdrop_core::DropError;
use flashdrop_core::reservation::ReservationStatus;
use flashdrop_core::types::{OrderId, SessionId};
use std::time::Duration;

async fn cart(drop: &TestDrop, session: &str) {
    for (product, quantity) in [("sku-1", 2), ("sku-2", 3)] {
        drop.services
            .reservations
            .create(CreateReservation::new(product, quantity, session))
            .await
            .unwrap();
    }
}

#[tokio::test]
async fn paid_order_sells_every_held_unit() {
    let drop = TestDrop::new();
    cart(&drop, "s1").await;
    let order = OrderId::new("order-1");

    let attached = drop
        .services
        .reservations
        .begin_checkout(&SessionId::new("s1"), &order)
        .await
        .unwrap();
    assert_eq!(attached.len(), 2);

    let outcomes = drop.services.payments.payment_settled(&order).await.unwrap();
    assert!(outcomes.iter().all(|o| o.is_ok()));
    assert_eq!(drop.count_with_status(ReservationStatus::Confirmed), 2);

    let first = drop.stock("sku-1");
    let second = drop.stock("sku-2");
    assert_eq!((first.quantity, first.reserved), (3, 0));
    assert_eq!((second.quantity, second.reserved), (97, 0));
    assert_eq!(drop.orders.fulfilled().len(), 2);

    // Redelivered settlement changes nothing.
    let again = drop.services.payments.payment_settled(&order).await.unwrap();
    assert!(again.iter().all(|o| o.is_ok()));
    assert_eq!(drop.stock("sku-1").quantity, 3);
    assert_eq!(drop.orders.fulfilled().len(), 2);
}

#[tokio::test]
async fn failed_payment_returns_the_units() {
    let drop = TestDrop::new();
    cart(&drop, "s1").await;
    let order = OrderId::new("order-1");
    drop.services
        .reservations
        .begin_checkout(&SessionId::new("s1"), &order)
        .await
        .unwrap();

    let outcomes = drop.services.payments.payment_failed(&order).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert_eq!(drop.count_with_status(ReservationStatus::Cancelled), 2);
    assert_eq!(drop.available("sku-1"), 5);
    assert_eq!(drop.available("sku-2"), 100);
    assert!(drop.orders.fulfilled().is_empty());
}

#[tokio::test]
async fn settlement_after_the_hold_lapsed_reports_expiry() {
    let drop = TestDrop::new();
    let held = drop
        .services
        .reservations
        .create(CreateReservation::new("sku-1", 1, "s1").with_ttl(Duration::from_secs(60)))
        .await
        .unwrap();
    let order = OrderId::new("order-1");
    drop.services
        .reservations
        .begin_checkout(&SessionId::new("s1"), &order)
        .await
        .unwrap();
    drop.clock.advance(chrono::Duration::seconds(61));

    let outcomes = drop.services.payments.payment_settled(&order).await.unwrap();
    assert_eq!(outcomes[0].result, Err(DropError::Expired(held.id)));
    assert_eq!(drop.available("sku-1"), 5);
    drop.assert_ledger_matches_reservations("sku-1");
}

#[tokio::test]
async fn unknown_orders_are_not_found() {
    let drop = TestDrop::new();
    assert!(matches!(
        drop.services.payments.payment_settled(&OrderId::new("nope")).await,
        Err(DropError::NotFound { entity: "order", .. })
    ));
}

#[tokio::test]
async fn order_service_outage_still_sells_the_stock() {
    let drop = TestDrop::new();
    drop.orders.set_failing(true);
    let held = drop
        .services
        .reservations
        .create(CreateReservation::new("sku-2", 4, "s1"))
        .await
        .unwrap();

    let confirmed = drop
        .services
        .reservations
        .confirm(held.id, OrderId::new("order-1"))
        .await
        .unwrap();
    assert_eq!(confirmed.status, ReservationStatus::Confirmed);
    assert_eq!(drop.stock("sku-2").quantity, 96);
}
