//! Random operation sequences must leave the stored documents consistent
//! after every step, with and without store transactions.

mod common;

use common::*;
use evecs::engine::{Deadline, EngineError};
use evecs::model::BookingPolicy;
use proptest::prelude::*;

const ROOMS: [(&str, &str); 3] = [("L1", "A"), ("L1", "B"), ("L2", "C")];

#[derive(Debug, Clone)]
enum Op {
    Create { slot: u8, room: usize, start: i64, len: i64, max_tick: u32 },
    Relocate { slot: u8, room: usize },
    Reschedule { slot: u8, start: i64, len: i64 },
    Delete { slot: u8 },
    Reserve { slot: u8, n: u32 },
    Release { slot: u8, n: u32 },
    Repair { room: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0u8..6, 0usize..3, 0i64..12, 1i64..4, 1u32..12).prop_map(|(slot, room, start, len, max_tick)| {
            Op::Create { slot, room, start, len, max_tick }
        }),
        2 => (0u8..6, 0usize..3).prop_map(|(slot, room)| Op::Relocate { slot, room }),
        2 => (0u8..6, 0i64..12, 1i64..4).prop_map(|(slot, start, len)| Op::Reschedule { slot, start, len }),
        1 => (0u8..6).prop_map(|slot| Op::Delete { slot }),
        2 => (0u8..6, 1u32..6).prop_map(|(slot, n)| Op::Reserve { slot, n }),
        1 => (0u8..6, 1u32..6).prop_map(|(slot, n)| Op::Release { slot, n }),
        1 => (0usize..3).prop_map(|room| Op::Repair { room }),
    ]
}

/// Refusals a well-behaved caller can see. Timeouts and store failures are bugs here.
fn expected_refusal(e: &EngineError) -> bool {
    matches!(
        e,
        EngineError::Capacity(_)
            | EngineError::CapacityExceeded { .. }
            | EngineError::NotFound(_)
            | EngineError::AlreadyExists(_)
            | EngineError::InvalidArgument(_)
    )
}

async fn run(ops: Vec<Op>, transactional: bool, policy: BookingPolicy) -> Result<(), TestCaseError> {
    let store = open_store("prop", transactional);
    let engine = engine_on(store.clone(), policy).await;
    seed(&engine).await;

    for op in ops {
        let d = Deadline::none();
        let outcome = match &op {
            Op::Create { slot, room, start, len, max_tick } => {
                let (loc, room) = ROOMS[*room];
                engine
                    .create_event(event(&format!("e{slot}"), loc, room, *start, start + len, *max_tick), d)
                    .await
                    .map(|_| ())
            }
            Op::Relocate { slot, room } => {
                let (loc, room) = ROOMS[*room];
                engine.relocate_event(&format!("e{slot}"), loc, room, d).await.map(|_| ())
            }
            Op::Reschedule { slot, start, len } => engine
                .reschedule_event(&format!("e{slot}"), at(*start), at(start + len), d)
                .await
                .map(|_| ()),
            Op::Delete { slot } => engine.delete_event(&format!("e{slot}"), d).await,
            Op::Reserve { slot, n } => engine.reserve(&format!("e{slot}"), *n, d).await.map(|_| ()),
            Op::Release { slot, n } => engine.release(&format!("e{slot}"), *n, d).await.map(|_| ()),
            Op::Repair { room } => {
                let report = engine
                    .repair_references(ROOMS[*room].0, d)
                    .await
                    .map_err(|e| TestCaseError::fail(format!("repair failed: {e}")))?;
                prop_assert!(report.is_clean(), "repair found drift after {:?}: {:?}", op, report);
                Ok(())
            }
        };
        if let Err(e) = &outcome {
            prop_assert!(expected_refusal(e), "{:?} failed unexpectedly: {}", op, e);
        }

        let broken = violations(&*store, policy).await;
        prop_assert!(broken.is_empty(), "after {:?}: {:?}", op, broken);
    }

    // The index agrees with the stored arrays.
    for loc in engine.list_locations().await.map_err(|e| TestCaseError::fail(e.to_string()))? {
        let stored: std::collections::BTreeSet<String> =
            loc.events_ids.iter().map(|r| r.event_id.clone()).collect();
        prop_assert_eq!(engine.index().events_in(&loc.location_id, None), stored);
    }
    Ok(())
}

fn check(ops: Vec<Op>, transactional: bool, policy: BookingPolicy) -> Result<(), TestCaseError> {
    let rt = tokio::runtime::Runtime::new().unwrap();
    rt.block_on(run(ops, transactional, policy))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn exclusive_transactional(ops in prop::collection::vec(arb_op(), 1..40)) {
        check(ops, true, BookingPolicy::Exclusive)?;
    }

    #[test]
    fn exclusive_two_phase(ops in prop::collection::vec(arb_op(), 1..40)) {
        check(ops, false, BookingPolicy::Exclusive)?;
    }

    #[test]
    fn shared_transactional(ops in prop::collection::vec(arb_op(), 1..40)) {
        check(ops, true, BookingPolicy::SharedByHeadcount)?;
    }

    #[test]
    fn shared_two_phase(ops in prop::collection::vec(arb_op(), 1..40)) {
        check(ops, false, BookingPolicy::SharedByHeadcount)?;
    }
}
