mod common;

use std::sync::Arc;

use common::*;
use evecs::engine::{CapacityConflict, Deadline, EngineError};
use evecs::model::BookingPolicy;

fn count_ok<T>(results: &[Result<T, EngineError>]) -> usize {
    results.iter().filter(|r| r.is_ok()).count()
}

async fn join<T: Send + 'static>(handles: Vec<tokio::task::JoinHandle<T>>) -> Vec<T> {
    futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn last_tickets_go_to_exactly_the_remaining_buyers() {
    for transactional in [true, false] {
        let store = open_store("last_tickets", transactional);
        let engine = Arc::new(engine_on(store.clone(), BookingPolicy::Exclusive).await);
        seed(&engine).await;
        engine
            .create_event(event("gig", "L1", "A", 0, 2, 10), Deadline::none())
            .await
            .unwrap();

        let handles = (0..25)
            .map(|_| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.reserve("gig", 1, Deadline::none()).await })
            })
            .collect();
        let results = join(handles).await;

        assert_eq!(count_ok(&results), 10);
        assert!(results.iter().all(|r| matches!(
            r,
            Ok(_) | Err(EngineError::CapacityExceeded { available: 0, .. })
        )));
        assert_eq!(engine.get_event("gig").await.unwrap().tickets_reserved, 10);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn reserves_and_releases_balance_out() {
    let store = open_store("balance", true);
    let engine = Arc::new(engine_on(store, BookingPolicy::Exclusive).await);
    seed(&engine).await;
    engine
        .create_event(event("gig", "L1", "A", 0, 2, 1000), Deadline::none())
        .await
        .unwrap();
    engine.reserve("gig", 500, Deadline::none()).await.unwrap();

    let handles = (0..40)
        .map(|i| {
            let engine = engine.clone();
            tokio::spawn(async move {
                if i % 2 == 0 {
                    engine.reserve("gig", 3, Deadline::none()).await
                } else {
                    engine.release("gig", 3, Deadline::none()).await
                }
            })
        })
        .collect();
    let results = join(handles).await;
    assert_eq!(count_ok(&results), 40);
    assert_eq!(engine.available_tickets("gig").await.unwrap(), 500);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn overlapping_creates_in_one_exclusive_room() {
    for transactional in [true, false] {
        let store = open_store("overlap_creates", transactional);
        let engine = Arc::new(engine_on(store.clone(), BookingPolicy::Exclusive).await);
        seed(&engine).await;

        let handles = (0..8)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .create_event(event(&format!("e{i}"), "L1", "A", 0, 2, 5), Deadline::none())
                        .await
                })
            })
            .collect();
        let results = join(handles).await;

        assert_eq!(count_ok(&results), 1);
        assert!(results.iter().filter(|r| r.is_err()).all(|r| matches!(
            r,
            Err(EngineError::Capacity(CapacityConflict::RoomOccupied { .. }))
        )));
        assert_eq!(engine.events_in("L1", Some("A")).await.unwrap().len(), 1);
        assert_eq!(violations(&*store, BookingPolicy::Exclusive).await, Vec::<String>::new());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn shared_room_fills_to_capacity_and_no_further() {
    for transactional in [true, false] {
        let store = open_store("shared_fill", transactional);
        let engine = Arc::new(engine_on(store.clone(), BookingPolicy::SharedByHeadcount).await);
        seed(&engine).await;

        // Room A holds 20; each event wants 4.
        let handles = (0..12)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    engine
                        .create_event(event(&format!("e{i}"), "L1", "A", 0, 2, 4), Deadline::none())
                        .await
                })
            })
            .collect();
        let results = join(handles).await;

        assert_eq!(count_ok(&results), 5);
        assert_eq!(
            violations(&*store, BookingPolicy::SharedByHeadcount).await,
            Vec::<String>::new()
        );
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn two_engines_on_one_store_never_double_book() {
    // Separate engines share no in-process gates; only versioned writes protect the room.
    for transactional in [true, false] {
        let store = open_store("two_engines", transactional);
        let first = Arc::new(engine_on(store.clone(), BookingPolicy::Exclusive).await);
        seed(&first).await;
        let second = Arc::new(engine_on(store.clone(), BookingPolicy::Exclusive).await);

        let handles = (0..10)
            .map(|i| {
                let engine = if i % 2 == 0 { first.clone() } else { second.clone() };
                tokio::spawn(async move {
                    engine
                        .create_event(event(&format!("e{i}"), "L2", "C", 1, 3, 5), Deadline::none())
                        .await
                })
            })
            .collect();
        let results = join(handles).await;

        assert_eq!(count_ok(&results), 1);
        assert_eq!(violations(&*store, BookingPolicy::Exclusive).await, Vec::<String>::new());

        // Each engine sees the other's booking.
        let winner = first.events_in("L2", Some("C")).await.unwrap();
        assert_eq!(winner.len(), 1);
        assert_eq!(second.events_in("L2", Some("C")).await.unwrap(), winner);

        first
            .create_event(event("late", "L1", "A", 5, 6, 5), Deadline::none())
            .await
            .unwrap();
        assert!(second.events_in("L1", None).await.unwrap().contains("late"));
        second.delete_event("late", Deadline::none()).await.unwrap();
        assert!(first.events_in("L1", Some("A")).await.unwrap().is_empty());
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn racing_moves_into_one_room() {
    for transactional in [true, false] {
        let store = open_store("racing_moves", transactional);
        let engine = Arc::new(engine_on(store.clone(), BookingPolicy::Exclusive).await);
        seed(&engine).await;
        for i in 0..6 {
            let room = if i % 2 == 0 { "A" } else { "B" };
            engine
                .create_event(event(&format!("e{i}"), "L1", room, i * 3, i * 3 + 2, 5), Deadline::none())
                .await
                .unwrap();
        }

        // All six land on the same window in L2/C.
        let handles = (0..6)
            .map(|i| {
                let engine = engine.clone();
                tokio::spawn(async move {
                    let id = format!("e{i}");
                    engine.relocate_event(&id, "L2", "C", Deadline::none()).await?;
                    engine.reschedule_event(&id, at(100), at(102), Deadline::none()).await
                })
            })
            .collect();
        let results = join(handles).await;

        assert_eq!(count_ok(&results), 1);
        assert_eq!(violations(&*store, BookingPolicy::Exclusive).await, Vec::<String>::new());
        let l1 = engine.events_in("L1", None).await.unwrap().len();
        let l2 = engine.events_in("L2", None).await.unwrap().len();
        assert_eq!(l1 + l2, 6);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_deletes_and_reserves() {
    let store = open_store("delete_vs_reserve", false);
    let engine = Arc::new(engine_on(store.clone(), BookingPolicy::Exclusive).await);
    seed(&engine).await;
    engine
        .create_event(event("gig", "L1", "A", 0, 2, 50), Deadline::none())
        .await
        .unwrap();

    let deleter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.delete_event("gig", Deadline::none()).await })
    };
    let buyers: Vec<_> = (0..10)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.reserve("gig", 1, Deadline::none()).await })
        })
        .collect();

    deleter.await.unwrap().unwrap();
    for r in join(buyers).await {
        assert!(matches!(r, Ok(_) | Err(EngineError::NotFound(_))));
    }
    assert!(engine.get_event("gig").await.is_err());
    assert_eq!(violations(&*store, BookingPolicy::Exclusive).await, Vec::<String>::new());
}
