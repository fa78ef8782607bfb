#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Map;
use ulid::Ulid;

use evecs::engine::{Engine, EngineConfig, peak_demand};
use evecs::model::*;
use evecs::notify::NotifyHub;
use evecs::store::{Collection, DocumentStore, LocalStore};

pub const HOUR: i64 = 3_600_000; // 1 hour in ms
const BASE: i64 = 1_700_000_000_000;

pub fn at(hour: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(BASE + hour * HOUR).unwrap()
}

pub fn fresh_wal(prefix: &str) -> PathBuf {
    let dir = std::env::temp_dir().join("evecs_int_test");
    std::fs::create_dir_all(&dir).unwrap();
    dir.join(format!("{prefix}_{}.wal", Ulid::new()))
}

pub fn open_store(prefix: &str, transactional: bool) -> Arc<LocalStore> {
    Arc::new(LocalStore::open(fresh_wal(prefix), transactional).unwrap())
}

pub async fn engine_on(store: Arc<LocalStore>, policy: BookingPolicy) -> Engine {
    let dyn_store: Arc<dyn DocumentStore> = store;
    let config = EngineConfig { policy, pending_grace: Duration::ZERO, ..EngineConfig::default() };
    Engine::new(dyn_store, Arc::new(NotifyHub::new()), config).await.unwrap()
}

/// User `u1`, location `L1` (rooms A=20, B=10) and `L2` (room C=15).
pub async fn seed(engine: &Engine) {
    engine
        .create_user(NewUser {
            user_id: Some("u1".into()),
            ip: "192.168.0.7".into(),
            email: "u1@example.com".into(),
            auth: true,
            password: "pw".into(),
            groups: vec![],
            extra: Map::new(),
        })
        .await
        .unwrap();
    for (id, name, rooms) in [
        ("L1", "North", vec![("A", 20), ("B", 10)]),
        ("L2", "South", vec![("C", 15)]),
    ] {
        engine
            .create_location(NewLocation {
                location_id: Some(id.into()),
                location_name: name.into(),
                rooms: rooms
                    .into_iter()
                    .map(|(room_id, capacity)| NewRoom {
                        room_id: Some(room_id.into()),
                        room_name: room_id.into(),
                        capacity,
                        description: None,
                    })
                    .collect(),
                extra: Map::new(),
            })
            .await
            .unwrap();
    }
}

pub fn event(id: &str, location: &str, room: &str, start: i64, end: i64, max_tick: u32) -> NewEvent {
    NewEvent {
        event_id: Some(id.into()),
        creator_id: vec!["u1".into()],
        code: None,
        name: id.into(),
        groups: vec![],
        tags: None,
        desc: String::new(),
        location_id: location.into(),
        room_id: room.into(),
        start_date: at(start),
        end_date: at(end),
        max_tick,
        img_url: None,
        extra: Map::new(),
    }
}

/// Every rule that must hold between operations, as a list of violations.
pub async fn violations(store: &dyn DocumentStore, policy: BookingPolicy) -> Vec<String> {
    let events: Vec<EventDoc> = store
        .scan(Collection::Events)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|v| v.doc.into_event())
        .collect();
    let locations: Vec<LocationDoc> = store
        .scan(Collection::Locations)
        .await
        .unwrap()
        .into_iter()
        .filter_map(|v| v.doc.into_location())
        .collect();
    let mut out = Vec::new();

    for ev in &events {
        if ev.pending.is_some() {
            out.push(format!("{} still pending", ev.event_id));
            continue;
        }
        if ev.tickets_reserved > ev.max_tick {
            out.push(format!("{} oversold", ev.event_id));
        }
        match locations.iter().find(|l| l.location_id == ev.location_id) {
            Some(loc) if loc.is_linked(&ev.room_id, &ev.event_id) => {}
            _ => out.push(format!("{} not linked at {}/{}", ev.event_id, ev.location_id, ev.room_id)),
        }
    }

    for loc in &locations {
        let mut seen = std::collections::HashSet::new();
        for r in &loc.events_ids {
            if !seen.insert(&r.event_id) {
                out.push(format!("{} listed twice in {}", r.event_id, loc.location_id));
            }
            if !events.iter().any(|e| e.event_id == r.event_id && e.location_id == loc.location_id) {
                out.push(format!("dangling {} in {}", r.event_id, loc.location_id));
            }
        }
        for room in &loc.rooms {
            let held: Vec<&EventDoc> = room
                .events_ids
                .iter()
                .filter_map(|r| {
                    let found = events.iter().find(|e| {
                        e.event_id == r.event_id
                            && e.location_id == loc.location_id
                            && e.room_id == room.room_id
                    });
                    if found.is_none() {
                        out.push(format!("dangling {} in {}/{}", r.event_id, loc.location_id, room.room_id));
                    }
                    found
                })
                .collect();

            match policy {
                BookingPolicy::Exclusive => {
                    for (i, a) in held.iter().enumerate() {
                        for b in &held[i + 1..] {
                            if a.span().overlaps(&b.span()) {
                                out.push(format!("{} overlaps {} in {}", a.event_id, b.event_id, room.room_id));
                            }
                        }
                    }
                }
                BookingPolicy::SharedByHeadcount => {
                    let slots: Vec<(Span, u32)> = held.iter().map(|e| (e.span(), e.max_tick)).collect();
                    for e in &held {
                        let peak = peak_demand(&slots, &e.span());
                        if peak > room.capacity as u64 {
                            out.push(format!("{} over capacity: {peak}", room.room_id));
                        }
                    }
                }
            }
        }
    }
    out
}
