use std::fmt;

use crate::store::StoreError;
use crate::validate::ValidationError;

/// Which entity an error is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntityRef {
    Event(String),
    Location(String),
    Room { location_id: String, room_id: String },
    User(String),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Event(id) => write!(f, "event {id}"),
            EntityRef::Location(id) => write!(f, "location {id}"),
            EntityRef::Room { location_id, room_id } => {
                write!(f, "room {room_id} in location {location_id}")
            }
            EntityRef::User(id) => write!(f, "user {id}"),
        }
    }
}

/// Why a room cannot take an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CapacityConflict {
    /// Exclusive policy: another event already holds an overlapping window.
    RoomOccupied {
        location_id: String,
        room_id: String,
        by_event: String,
    },
    /// Shared policy: peak overlapping headcount would exceed the room.
    HeadcountExceeded {
        location_id: String,
        room_id: String,
        capacity: u32,
        demand: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    Validation(ValidationError),
    NotFound(EntityRef),
    AlreadyExists(EntityRef),
    /// Placement would break the room's booking policy.
    Capacity(CapacityConflict),
    /// Reservation would push `tickets_reserved` past `max_tick`.
    CapacityExceeded {
        event_id: String,
        requested: u32,
        available: u32,
    },
    InvalidArgument(String),
    /// Deadline passed, or conflicts kept recurring past the retry budget.
    Timeout { op: &'static str, attempts: u32 },
    HasEvents {
        location_id: String,
        room_id: Option<String>,
        count: usize,
    },
    LimitExceeded(&'static str),
    Store(StoreError),
}

impl EngineError {
    /// Internal optimistic-concurrency conflict, absorbed by the retry driver.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(self, EngineError::Store(e) if e.is_retryable())
    }

    pub(crate) fn conflict(key: crate::store::DocKey) -> Self {
        EngineError::Store(StoreError::Conflict(key))
    }

    /// Short label for metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "validation",
            EngineError::NotFound(_) => "not_found",
            EngineError::AlreadyExists(_) => "already_exists",
            EngineError::Capacity(_) => "capacity",
            EngineError::CapacityExceeded { .. } => "capacity_exceeded",
            EngineError::InvalidArgument(_) => "invalid_argument",
            EngineError::Timeout { .. } => "timeout",
            EngineError::HasEvents { .. } => "has_events",
            EngineError::LimitExceeded(_) => "limit_exceeded",
            EngineError::Store(_) => "store_error",
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Validation(e) => write!(f, "validation failed: {e}"),
            EngineError::NotFound(what) => write!(f, "not found: {what}"),
            EngineError::AlreadyExists(what) => write!(f, "already exists: {what}"),
            EngineError::Capacity(CapacityConflict::RoomOccupied {
                location_id,
                room_id,
                by_event,
            }) => write!(
                f,
                "room {room_id} in location {location_id} is already booked by event {by_event} for an overlapping window"
            ),
            EngineError::Capacity(CapacityConflict::HeadcountExceeded {
                location_id,
                room_id,
                capacity,
                demand,
            }) => write!(
                f,
                "room {room_id} in location {location_id} holds {capacity}, overlapping demand would be {demand}"
            ),
            EngineError::CapacityExceeded {
                event_id,
                requested,
                available,
            } => write!(
                f,
                "event {event_id}: requested {requested} tickets, only {available} left"
            ),
            EngineError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            EngineError::Timeout { op, attempts } => {
                write!(f, "{op} timed out after {attempts} attempt(s)")
            }
            EngineError::HasEvents {
                location_id,
                room_id: Some(room_id),
                count,
            } => write!(
                f,
                "room {room_id} in location {location_id} still holds {count} event(s)"
            ),
            EngineError::HasEvents {
                location_id,
                room_id: None,
                count,
            } => write!(f, "location {location_id} still holds {count} event(s)"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::Store(e) => write!(f, "store error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}

impl From<ValidationError> for EngineError {
    fn from(e: ValidationError) -> Self {
        EngineError::Validation(e)
    }
}

impl From<StoreError> for EngineError {
    fn from(e: StoreError) -> Self {
        EngineError::Store(e)
    }
}
