use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Unix milliseconds.
pub type Ms = i64;

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: Ms,
    pub end: Ms,
}

impl Span {
    pub fn new(start: Ms, end: Ms) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    pub fn duration_ms(&self) -> Ms {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// How a room may be shared between events whose windows overlap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingPolicy {
    /// At most one event per overlapping window.
    #[default]
    Exclusive,
    /// Overlapping events may share as long as the summed `max_tick` fits `capacity`.
    SharedByHeadcount,
}

/// Back-reference entry, stored as `{ "event_id": ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EventRef {
    pub event_id: String,
}

impl EventRef {
    pub fn new(event_id: impl Into<String>) -> Self {
        Self { event_id: event_id.into() }
    }
}

/// Add `event_id` to a back-reference list. Returns false if it was already there.
pub fn link(refs: &mut Vec<EventRef>, event_id: &str) -> bool {
    if refs.iter().any(|r| r.event_id == event_id) {
        return false;
    }
    refs.push(EventRef::new(event_id));
    true
}

/// Remove `event_id` from a back-reference list. Returns false if it was absent.
pub fn unlink(refs: &mut Vec<EventRef>, event_id: &str) -> bool {
    let before = refs.len();
    refs.retain(|r| r.event_id != event_id);
    refs.len() != before
}

pub fn contains(refs: &[EventRef], event_id: &str) -> bool {
    refs.iter().any(|r| r.event_id == event_id)
}

/// Where and when an event takes place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Placement {
    pub location_id: String,
    pub room_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
}

impl Placement {
    pub fn span(&self) -> Span {
        Span::new(self.start_date.timestamp_millis(), self.end_date.timestamp_millis())
    }

    pub fn same_room(&self, other: &Placement) -> bool {
        self.location_id == other.location_id && self.room_id == other.room_id
    }
}

/// In-flight marker written by the two-phase protocol. An event carrying
/// one is not yet (or no longer) guaranteed to be linked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PendingOp {
    Create,
    Move { to: Placement },
    Delete,
    /// `max_tick` already holds the raised value; reserves stay under `from`
    /// until the marker clears.
    Raise { from: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pending {
    #[serde(flatten)]
    pub op: PendingOp,
    pub since: Ms,
}

/// Properties `EventDoc` declares. None of them may also live in `extra`.
pub const EVENT_FIELDS: [&str; 15] = [
    "event_id",
    "creator_id",
    "code",
    "name",
    "groups",
    "tags",
    "desc",
    "location_id",
    "room_id",
    "start_date",
    "end_date",
    "max_tick",
    "tickets_reserved",
    "img_url",
    "pending",
];

/// Properties `LocationDoc` declares.
pub const LOCATION_FIELDS: [&str; 4] = ["location_id", "location_name", "events_ids", "rooms"];

/// Properties `UserDoc` declares, in their stored spelling.
pub const USER_FIELDS: [&str; 6] = ["user_id", "IP", "email", "auth", "password", "groups"];

/// Remove undeclared-map entries that shadow a declared field. A flattened map
/// holding one would serialize the key twice and the stored body would no
/// longer parse. Returns the dropped keys.
pub fn drop_declared(extra: &mut Map<String, Value>, declared: &[&str]) -> Vec<String> {
    let dropped: Vec<String> = extra
        .keys()
        .filter(|k| declared.contains(&k.as_str()))
        .cloned()
        .collect();
    for key in &dropped {
        extra.remove(key);
    }
    dropped
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDoc {
    pub event_id: String,
    pub creator_id: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    pub name: String,
    pub groups: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
    pub desc: String,
    pub location_id: String,
    pub room_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub max_tick: u32,
    #[serde(default)]
    pub tickets_reserved: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub img_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<Pending>,
    /// Undeclared properties, carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EventDoc {
    pub fn placement(&self) -> Placement {
        Placement {
            location_id: self.location_id.clone(),
            room_id: self.room_id.clone(),
            start_date: self.start_date,
            end_date: self.end_date,
        }
    }

    pub fn set_placement(&mut self, p: Placement) {
        self.location_id = p.location_id;
        self.room_id = p.room_id;
        self.start_date = p.start_date;
        self.end_date = p.end_date;
    }

    pub fn span(&self) -> Span {
        self.placement().span()
    }

    pub fn is_pending_delete(&self) -> bool {
        matches!(self.pending, Some(Pending { op: PendingOp::Delete, .. }))
    }

    /// The ceiling reserves may fill right now.
    pub fn ticket_ceiling(&self) -> u32 {
        match &self.pending {
            Some(Pending { op: PendingOp::Raise { from }, .. }) => (*from).min(self.max_tick),
            _ => self.max_tick,
        }
    }

    pub fn remaining_tickets(&self) -> u32 {
        self.ticket_ceiling().saturating_sub(self.tickets_reserved)
    }
}

/// Rooms are closed: unknown fields are rejected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RoomDoc {
    #[serde(default)]
    pub room_id: String,
    pub room_name: String,
    pub capacity: u32,
    #[serde(default)]
    pub events_ids: Vec<EventRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationDoc {
    #[serde(default)]
    pub location_id: String,
    pub location_name: String,
    /// Building-level aggregate of every event booked in any room.
    #[serde(default)]
    pub events_ids: Vec<EventRef>,
    pub rooms: Vec<RoomDoc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl LocationDoc {
    pub fn room(&self, room_id: &str) -> Option<&RoomDoc> {
        self.rooms.iter().find(|r| r.room_id == room_id)
    }

    pub fn room_mut(&mut self, room_id: &str) -> Option<&mut RoomDoc> {
        self.rooms.iter_mut().find(|r| r.room_id == room_id)
    }

    /// Link an event at building and room level. Returns false if the room is unknown.
    pub fn link_event(&mut self, room_id: &str, event_id: &str) -> bool {
        let Some(room) = self.room_mut(room_id) else {
            return false;
        };
        link(&mut room.events_ids, event_id);
        link(&mut self.events_ids, event_id);
        true
    }

    /// Unlink an event from the building and from whichever room holds it.
    pub fn unlink_event(&mut self, event_id: &str) {
        unlink(&mut self.events_ids, event_id);
        for room in &mut self.rooms {
            unlink(&mut room.events_ids, event_id);
        }
    }

    pub fn is_linked(&self, room_id: &str, event_id: &str) -> bool {
        contains(&self.events_ids, event_id)
            && self.room(room_id).is_some_and(|r| contains(&r.events_ids, event_id))
    }
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct UserDoc {
    pub user_id: String,
    #[serde(rename = "IP")]
    pub ip: String,
    pub email: String,
    pub auth: bool,
    pub password: String,
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for UserDoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserDoc")
            .field("user_id", &self.user_id)
            .field("ip", &self.ip)
            .field("email", &self.email)
            .field("auth", &self.auth)
            .field("password", &"<redacted>")
            .field("groups", &self.groups)
            .finish_non_exhaustive()
    }
}

// ── Inputs ───────────────────────────────────────────────────────

/// Request to create an event. `event_id` is generated when absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewEvent {
    #[serde(default)]
    pub event_id: Option<String>,
    pub creator_id: Vec<String>,
    #[serde(default)]
    pub code: Option<String>,
    pub name: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub desc: String,
    pub location_id: String,
    pub room_id: String,
    pub start_date: DateTime<Utc>,
    pub end_date: DateTime<Utc>,
    pub max_tick: u32,
    #[serde(default)]
    pub img_url: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NewRoom {
    #[serde(default)]
    pub room_id: Option<String>,
    pub room_name: String,
    pub capacity: u32,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewLocation {
    #[serde(default)]
    pub location_id: Option<String>,
    pub location_name: String,
    pub rooms: Vec<NewRoom>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NewUser {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(rename = "IP")]
    pub ip: String,
    pub email: String,
    pub auth: bool,
    pub password: String,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl fmt::Debug for NewUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewUser")
            .field("user_id", &self.user_id)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish_non_exhaustive()
    }
}

/// Partial room edit. `None` leaves the field as is.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomPatch {
    pub room_name: Option<String>,
    pub capacity: Option<u32>,
    pub description: Option<String>,
}

// ── Notifications ────────────────────────────────────────────────

/// Broadcast per location whenever its back-references or an event's counter change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlacementChange {
    EventPlaced { event_id: String, room_id: String },
    EventRemoved { event_id: String, room_id: String },
    TicketsChanged { event_id: String, tickets_reserved: u32 },
    ReferencesRepaired { added: usize, removed: usize },
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn location_json() -> Value {
        json!({
            "location_id": "loc-1",
            "location_name": "Main Hall",
            "events_ids": [{"event_id": "e1"}],
            "rooms": [
                {"room_id": "r1", "room_name": "A", "capacity": 50, "events_ids": [{"event_id": "e1"}]},
                {"room_id": "r2", "room_name": "B", "capacity": 10}
            ],
            "parking": {"spaces": 12}
        })
    }

    #[test]
    fn span_overlap() {
        let a = Span::new(100, 200);
        let b = Span::new(150, 250);
        let c = Span::new(200, 300);
        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c)); // adjacent, not overlapping
    }

    #[test]
    fn link_is_idempotent() {
        let mut refs = Vec::new();
        assert!(link(&mut refs, "e1"));
        assert!(!link(&mut refs, "e1"));
        assert_eq!(refs, vec![EventRef::new("e1")]);
        assert!(unlink(&mut refs, "e1"));
        assert!(!unlink(&mut refs, "e1"));
        assert!(refs.is_empty());
    }

    #[test]
    fn location_unknown_fields_survive_roundtrip() {
        let doc: LocationDoc = serde_json::from_value(location_json()).unwrap();
        assert_eq!(doc.extra.get("parking"), Some(&json!({"spaces": 12})));
        let back = serde_json::to_value(&doc).unwrap();
        assert_eq!(back["parking"], json!({"spaces": 12}));
        assert_eq!(back["rooms"][1]["events_ids"], json!([]));
    }

    #[test]
    fn room_rejects_unknown_fields() {
        let mut v = location_json();
        v["rooms"][0]["projector"] = json!(true);
        assert!(serde_json::from_value::<LocationDoc>(v).is_err());
    }

    #[test]
    fn link_and_unlink_event_on_location() {
        let mut doc: LocationDoc = serde_json::from_value(location_json()).unwrap();
        assert!(doc.link_event("r2", "e2"));
        assert!(doc.is_linked("r2", "e2"));
        assert!(!doc.link_event("nope", "e3"));
        assert!(!contains(&doc.events_ids, "e3"));

        doc.unlink_event("e2");
        assert!(!doc.is_linked("r2", "e2"));
        assert!(doc.is_linked("r1", "e1"));
    }

    #[test]
    fn pending_marker_serialization() {
        let p = Pending { op: PendingOp::Delete, since: 42 };
        let v = serde_json::to_value(&p).unwrap();
        assert_eq!(v, json!({"op": "delete", "since": 42}));
        let back: Pending = serde_json::from_value(v).unwrap();
        assert_eq!(back, p);
    }

    #[test]
    fn shadowing_extra_keys_are_dropped() {
        let mut extra = Map::new();
        extra.insert("tickets_reserved".into(), json!(7));
        extra.insert("pending".into(), json!({"op": "create", "since": 1}));
        extra.insert("sponsor".into(), json!("acme"));
        let mut dropped = drop_declared(&mut extra, &EVENT_FIELDS);
        dropped.sort();
        assert_eq!(dropped, vec!["pending".to_string(), "tickets_reserved".to_string()]);
        assert_eq!(extra.len(), 1);
        assert!(extra.contains_key("sponsor"));
    }

    #[test]
    fn raise_in_flight_keeps_old_ceiling() {
        let mut ev: EventDoc = serde_json::from_value(json!({
            "event_id": "e1", "creator_id": ["u1"], "name": "gig", "groups": [], "desc": "",
            "location_id": "L1", "room_id": "A",
            "start_date": "2025-06-01T10:00:00Z", "end_date": "2025-06-01T12:00:00Z",
            "max_tick": 30, "tickets_reserved": 8
        }))
        .unwrap();
        assert_eq!(ev.remaining_tickets(), 22);
        ev.pending = Some(Pending { op: PendingOp::Raise { from: 10 }, since: 0 });
        assert_eq!(ev.ticket_ceiling(), 10);
        assert_eq!(ev.remaining_tickets(), 2);
        assert_eq!(
            serde_json::to_value(ev.pending.as_ref().unwrap()).unwrap(),
            json!({"op": "raise", "from": 10, "since": 0})
        );
    }

    #[test]
    fn user_debug_redacts_password() {
        let user = UserDoc {
            user_id: "u1".into(),
            ip: "10.0.0.1".into(),
            email: "a@b.io".into(),
            auth: true,
            password: "hunter2".into(),
            groups: vec![],
            extra: Map::new(),
        };
        let dbg = format!("{user:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("<redacted>"));
    }

    #[test]
    fn user_ip_field_is_uppercase_on_the_wire() {
        let v = json!({
            "user_id": "u1", "IP": "10.0.0.1", "email": "a@b.io",
            "auth": false, "password": "x", "groups": ["staff"]
        });
        let user: UserDoc = serde_json::from_value(v).unwrap();
        assert_eq!(user.ip, "10.0.0.1");
        assert!(user.extra.is_empty());
    }
}
