//! Queue admission across joins, leaves, sessions and capacity changes.

#![allow(clippy::unwrap_used)]

mod common;

use common::TestDrop;
use drops::CreateReservation;
use flashdrop_core::DropError;
use flashdrop_core::queue::{QueuePosition, QueueState};
use flashdrop_core::reservation::ReservationStatus;
use flashdrop_core::sync::{SyncEventKind, SyncPayload};
use flashdrop_core::types::{DropId, SessionId, UserId};

fn user(name: &str) -> UserId {
    UserId::new(name)
}

fn session(name: &str) -> SessionId {
    SessionId::new(format!("{name}-session"))
}

#[tokio::test]
async fn third_shopper_waits_until_a_slot_frees() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 2).await.unwrap();

    assert!(drop.services.admission.join(&d1, &user("alice"), &session("alice")).await.unwrap().admitted);
    assert!(drop.services.admission.join(&d1, &user("bob"), &session("bob")).await.unwrap().admitted);
    let carol = drop.services.admission.join(&d1, &user("carol"), &session("carol")).await.unwrap();
    assert_eq!(carol.position, QueuePosition::Waiting { position: 1 });
    assert_eq!(carol.estimated_wait_seconds, 300);

    drop.bus.clear();
    let left = drop.services.admission.leave(&d1, &user("alice")).await.unwrap();
    assert_eq!(left.removed_from, Some(QueueState::Active));
    assert_eq!(left.promoted, vec![user("carol")]);

    let carol = drop.services.admission.status(&d1, &user("carol")).await.unwrap();
    assert!(carol.admitted);
    assert_eq!(carol.estimated_wait_seconds, 0);

    let events = drop.bus.published_for(&d1);
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SyncEventKind::QueueUpdate);
    assert!(matches!(
        &events[0].payload,
        SyncPayload::Queue { active: 2, waiting: 0, promoted, .. } if promoted == &vec![user("carol")]
    ));
}

#[tokio::test]
async fn waiting_line_is_first_in_first_out() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 1).await.unwrap();

    for name in ["a", "b", "c", "d"] {
        drop.services.admission.join(&d1, &user(name), &session(name)).await.unwrap();
    }

    let mut admitted = Vec::new();
    for name in ["a", "b", "c"] {
        let left = drop.services.admission.leave(&d1, &user(name)).await.unwrap();
        admitted.extend(left.promoted);
    }
    assert_eq!(admitted, vec![user("b"), user("c"), user("d")]);
}

#[tokio::test]
async fn raising_capacity_admits_the_head_of_the_line() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 1).await.unwrap();
    for name in ["a", "b", "c"] {
        drop.services.admission.join(&d1, &user(name), &session(name)).await.unwrap();
    }

    let queue = drop.services.admission.configure_drop(&d1, 2).await.unwrap();
    assert_eq!(queue.active_count(), 2);
    assert!(drop.services.admission.status(&d1, &user("b")).await.unwrap().admitted);
    assert_eq!(
        drop.services.admission.status(&d1, &user("c")).await.unwrap().position,
        QueuePosition::Waiting { position: 1 }
    );
}

#[tokio::test]
async fn ending_a_session_releases_holds_and_promotes() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 1).await.unwrap();
    drop.services.admission.join(&d1, &user("alice"), &session("alice")).await.unwrap();
    drop.services.admission.join(&d1, &user("bob"), &session("bob")).await.unwrap();

    drop.services
        .reservations
        .create(CreateReservation::new("sku-1", 3, session("alice")))
        .await
        .unwrap();
    assert_eq!(drop.available("sku-1"), 2);

    let ended = drop
        .services
        .sessions
        .end_session(&d1, &user("alice"), &session("alice"))
        .await
        .unwrap();
    assert_eq!(ended.cancelled.len(), 1);
    assert_eq!(ended.left.promoted, vec![user("bob")]);
    assert_eq!(drop.available("sku-1"), 5);
    drop.assert_ledger_matches_reservations("sku-1");
}

#[tokio::test]
async fn overstayed_shoppers_are_swept_out() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 1).await.unwrap();
    drop.services.admission.join(&d1, &user("alice"), &session("alice")).await.unwrap();
    drop.services.admission.join(&d1, &user("bob"), &session("bob")).await.unwrap();
    drop.services
        .reservations
        .create(CreateReservation::new("sku-1", 4, session("alice")))
        .await
        .unwrap();
    assert_eq!(drop.available("sku-1"), 1);

    assert_eq!(drop.services.sweeper.sweep_once().await.unwrap(), 0);
    drop.clock.advance(chrono::Duration::minutes(11));
    assert_eq!(drop.services.sweeper.sweep_once().await.unwrap(), 1);

    assert_eq!(
        drop.services.admission.status(&d1, &user("alice")).await.unwrap().position,
        QueuePosition::NotQueued
    );
    assert!(drop.services.admission.status(&d1, &user("bob")).await.unwrap().admitted);
    assert_eq!(drop.available("sku-1"), 5);
    assert_eq!(drop.count_with_status(ReservationStatus::Cancelled), 1);
    drop.assert_ledger_matches_reservations("sku-1");
}

#[tokio::test]
async fn capacity_cannot_be_lowered_under_active_shoppers() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 2).await.unwrap();
    drop.services.admission.join(&d1, &user("alice"), &session("alice")).await.unwrap();
    drop.services.admission.join(&d1, &user("bob"), &session("bob")).await.unwrap();

    let lowered = drop.services.admission.configure_drop(&d1, 1).await;
    assert!(matches!(lowered, Err(DropError::InvalidState(_))));
    let queue = drop.services.admission.queue(&d1).await.unwrap();
    assert_eq!((queue.active_count(), queue.max_concurrent_users), (2, 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_joins_never_exceed_the_bound() {
    let drop = TestDrop::new();
    let d1 = DropId::new("d1");
    drop.services.admission.configure_drop(&d1, 3).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..12 {
        let admission = drop.services.admission.clone();
        let d1 = d1.clone();
        handles.push(tokio::spawn(async move {
            let name = format!("u{i}");
            admission.join(&d1, &user(&name), &session(&name)).await
        }));
    }
    let mut admitted = 0;
    for handle in handles {
        if handle.await.unwrap().unwrap().admitted {
            admitted += 1;
        }
    }

    assert_eq!(admitted, 3);
    let queue = drop.services.admission.queue(&d1).await.unwrap();
    assert_eq!((queue.active_count(), queue.waiting_count()), (3, 9));
}
