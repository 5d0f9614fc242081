//! Random reservation histories never break the stock accounting.

#![allow(clippy::unwrap_used)]

mod common;

use common::TestDrop;
use drops::CreateReservation;
use flashdrop_core::reservation::ReservationStatus;
use flashdrop_core::types::{OrderId, ProductId, ReservationId, SessionId};
use proptest::prelude::*;
use std::time::Duration;

const UNITS: u32 = 5;

#[derive(Debug, Clone)]
enum Op {
    Create { quantity: u32, session: u8 },
    Confirm(usize),
    Cancel(usize),
    Advance(i64),
    Reap,
    EndSession(u8),
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (1u32..=3, 0u8..3).prop_map(|(quantity, session)| Op::Create { quantity, session }),
        2 => any::<usize>().prop_map(Op::Confirm),
        2 => any::<usize>().prop_map(Op::Cancel),
        1 => (0i64..90).prop_map(Op::Advance),
        1 => Just(Op::Reap),
        1 => (0u8..3).prop_map(Op::EndSession),
    ]
}

fn pick(ids: &[ReservationId], index: usize) -> Option<ReservationId> {
    (!ids.is_empty()).then(|| ids[index % ids.len()])
}

async fn run(ops: Vec<Op>) -> Result<(), TestCaseError> {
    let drop = TestDrop::new();
    let reservations = &drop.services.reservations;
    drop.services
        .ledger
        .get_or_init(&ProductId::new("sku-1"))
        .await
        .unwrap();
    let mut ids = Vec::new();

    for (step, op) in ops.into_iter().enumerate() {
        match op {
            Op::Create { quantity, session } => {
                let request = CreateReservation::new("sku-1", quantity, format!("s{session}"))
                    .with_ttl(Duration::from_secs(60));
                if let Ok(reservation) = reservations.create(request).await {
                    ids.push(reservation.id);
                }
            }
            Op::Confirm(index) => {
                if let Some(id) = pick(&ids, index) {
                    let _ = reservations.confirm(id, OrderId::new(format!("o{step}"))).await;
                }
            }
            Op::Cancel(index) => {
                if let Some(id) = pick(&ids, index) {
                    let _ = reservations.cancel(id).await;
                }
            }
            Op::Advance(secs) => drop.clock.advance(chrono::Duration::seconds(secs)),
            Op::Reap => {
                drop.services.reaper.sweep_once().await.unwrap();
            }
            Op::EndSession(session) => {
                reservations
                    .cancel_for_session(&SessionId::new(format!("s{session}")))
                    .await
                    .unwrap();
            }
        }

        let record = drop.stock("sku-1");
        let all = drop.reservations.all();
        let units = |status: ReservationStatus| -> u32 {
            all.iter().filter(|r| r.status == status).map(|r| r.quantity).sum()
        };
        prop_assert!(record.is_consistent());
        prop_assert_eq!(record.reserved, units(ReservationStatus::Active));
        prop_assert_eq!(record.quantity + units(ReservationStatus::Confirmed), UNITS);
        prop_assert_eq!(drop.orders.fulfilled().len(), drop.count_with_status(ReservationStatus::Confirmed));
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stock_matches_reservations_after_every_step(
        ops in proptest::collection::vec(op_strategy(), 1..40),
    ) {
        tokio_test::block_on(run(ops))?;
    }
}
