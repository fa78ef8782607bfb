use chrono::{DateTime, Utc};

use crate::limits::*;
use crate::model::*;
use crate::validate::ValidationError;

use super::{CapacityConflict, EngineError, EntityRef};

pub(crate) fn now_ms() -> Ms {
    Utc::now().timestamp_millis()
}

/// An event holding (or about to hold) part of a room's timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Occupant {
    pub event_id: String,
    pub span: Span,
    pub demand: u32,
}

/// `start < end`, inside the supported range, and not absurdly long.
pub(crate) fn validate_window(
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Span, EngineError> {
    let (s, e) = (start.timestamp_millis(), end.timestamp_millis());
    if s >= e {
        return Err(ValidationError::new("end_date", "must be after start_date").into());
    }
    if s < MIN_VALID_TIMESTAMP_MS || e > MAX_VALID_TIMESTAMP_MS {
        return Err(EngineError::LimitExceeded("timestamp out of range"));
    }
    if e - s > MAX_EVENT_DURATION_MS {
        return Err(EngineError::LimitExceeded("event too long"));
    }
    Ok(Span::new(s, e))
}

pub(crate) fn room_of<'a>(
    location: &'a LocationDoc,
    room_id: &str,
) -> Result<&'a RoomDoc, EngineError> {
    location.room(room_id).ok_or_else(|| {
        EngineError::NotFound(EntityRef::Room {
            location_id: location.location_id.clone(),
            room_id: room_id.to_string(),
        })
    })
}

/// Can `candidate` take `span` in `room` next to `occupants`?
///
/// Occupants must already exclude the candidate itself.
pub(crate) fn check_placement(
    policy: BookingPolicy,
    location_id: &str,
    room: &RoomDoc,
    span: Span,
    demand: u32,
    occupants: &[Occupant],
) -> Result<(), EngineError> {
    if room.events_ids.len() >= MAX_EVENTS_PER_ROOM {
        return Err(EngineError::LimitExceeded("too many events in room"));
    }
    match policy {
        BookingPolicy::Exclusive => {
            if let Some(by) = occupants.iter().find(|o| o.span.overlaps(&span)) {
                return Err(EngineError::Capacity(CapacityConflict::RoomOccupied {
                    location_id: location_id.to_string(),
                    room_id: room.room_id.clone(),
                    by_event: by.event_id.clone(),
                }));
            }
        }
        BookingPolicy::SharedByHeadcount => {
            let allocs: Vec<(Span, u32)> = occupants.iter().map(|o| (o.span, o.demand)).collect();
            let total = peak_demand(&allocs, &span) + demand as u64;
            if total > room.capacity as u64 {
                return Err(EngineError::Capacity(CapacityConflict::HeadcountExceeded {
                    location_id: location_id.to_string(),
                    room_id: room.room_id.clone(),
                    capacity: room.capacity,
                    demand: total,
                }));
            }
        }
    }
    Ok(())
}

/// Sweep-line: highest summed weight at any instant inside `window`.
///
/// Spans are half-open, so one allocation ending exactly where another
/// starts never counts twice.
pub fn peak_demand(allocs: &[(Span, u32)], window: &Span) -> u64 {
    // +w at start, -w at end; ends sort before starts at the same instant
    let mut points: Vec<(Ms, i64)> = Vec::with_capacity(allocs.len() * 2);
    for (span, weight) in allocs {
        if !span.overlaps(window) || *weight == 0 {
            continue;
        }
        points.push((span.start.max(window.start), *weight as i64));
        points.push((span.end.min(window.end), -(*weight as i64)));
    }
    points.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut current: i64 = 0;
    let mut peak: i64 = 0;
    for (_, delta) in &points {
        current += delta;
        peak = peak.max(current);
    }
    peak as u64
}

/// Peak over the whole timeline.
pub(crate) fn peak_overall(occupants: &[Occupant]) -> u64 {
    let allocs: Vec<(Span, u32)> = occupants.iter().map(|o| (o.span, o.demand)).collect();
    peak_demand(&allocs, &Span::new(Ms::MIN, Ms::MAX))
}
