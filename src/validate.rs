//! Field validators for the three document shapes.
//!
//! These work on raw JSON so that malformed input is rejected before any
//! typed value exists, and before any write happens. Event, Location and
//! User objects are open (unknown properties are accepted and preserved);
//! Room entries are closed.

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::LazyLock;

use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::model::{NewEvent, NewLocation, NewUser};

static ISO_UTC: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2}(\.\d{1,9})?Z$").expect("static regex")
});

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,}$").expect("static regex")
});

static URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(https?://)?([\w-]+\.)+[\w-]+(:\d+)?(/[\w\-._~:/?#\[\]@!$&'()*+,;=%]*)?$")
        .expect("static regex")
});

const ROOM_FIELDS: [&str; 5] = ["room_id", "room_name", "capacity", "events_ids", "description"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self { field: field.into(), reason: reason.into() }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid `{}`: {}", self.field, self.reason)
    }
}

impl std::error::Error for ValidationError {}

pub fn is_iso_utc(s: &str) -> bool {
    ISO_UTC.is_match(s) && chrono::DateTime::parse_from_rfc3339(s).is_ok()
}

pub fn is_email(s: &str) -> bool {
    EMAIL.is_match(s)
}

/// Strict dotted quad: four decimal octets, no leading zeros.
pub fn is_ipv4(s: &str) -> bool {
    s.split('.').count() == 4 && s.parse::<Ipv4Addr>().is_ok()
}

/// Empty string is accepted; anything else must look like a URL.
pub fn is_url_or_empty(s: &str) -> bool {
    s.is_empty() || URL.is_match(s)
}

// ── Field helpers ────────────────────────────────────────────────

fn object<'a>(v: &'a Value, what: &str) -> Result<&'a Map<String, Value>, ValidationError> {
    v.as_object()
        .ok_or_else(|| ValidationError::new(what, "expected a JSON object"))
}

fn required<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a Value, ValidationError> {
    obj.get(field)
        .ok_or_else(|| ValidationError::new(field, "missing mandatory field"))
}

fn string<'a>(obj: &'a Map<String, Value>, field: &str) -> Result<&'a str, ValidationError> {
    required(obj, field)?
        .as_str()
        .ok_or_else(|| ValidationError::new(field, "expected a string"))
}

fn non_empty(obj: &Map<String, Value>, field: &str) -> Result<(), ValidationError> {
    if string(obj, field)?.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty"));
    }
    Ok(())
}

fn optional_string(obj: &Map<String, Value>, field: &str) -> Result<(), ValidationError> {
    match obj.get(field) {
        None | Some(Value::Null) | Some(Value::String(_)) => Ok(()),
        Some(_) => Err(ValidationError::new(field, "expected a string")),
    }
}

fn string_array(obj: &Map<String, Value>, field: &str, optional: bool) -> Result<(), ValidationError> {
    let Some(v) = obj.get(field) else {
        return if optional {
            Ok(())
        } else {
            Err(ValidationError::new(field, "missing mandatory field"))
        };
    };
    let arr = v
        .as_array()
        .ok_or_else(|| ValidationError::new(field, "expected an array"))?;
    if arr.iter().any(|x| !x.is_string()) {
        return Err(ValidationError::new(field, "expected an array of strings"));
    }
    Ok(())
}

fn non_negative_int(obj: &Map<String, Value>, field: &str) -> Result<(), ValidationError> {
    match required(obj, field)?.as_u64() {
        Some(n) if n <= u64::from(u32::MAX) => Ok(()),
        Some(_) => Err(ValidationError::new(field, "out of range")),
        None => Err(ValidationError::new(field, "expected a non-negative integer")),
    }
}

fn timestamp(obj: &Map<String, Value>, field: &str) -> Result<(), ValidationError> {
    if !is_iso_utc(string(obj, field)?) {
        return Err(ValidationError::new(field, "expected an ISO-8601 UTC timestamp"));
    }
    Ok(())
}

fn typed<T: DeserializeOwned>(v: Value, what: &str) -> Result<T, ValidationError> {
    serde_json::from_value(v).map_err(|e| ValidationError::new(what, e.to_string()))
}

// ── Documents ────────────────────────────────────────────────────

/// Validate an event creation request and convert it. A fetched event sent
/// back as-is carries `tickets_reserved` and maybe `pending`; both are dropped.
pub fn event_input(v: Value) -> Result<NewEvent, ValidationError> {
    let obj = object(&v, "event")?;
    if obj.contains_key("event_id") {
        non_empty(obj, "event_id")?;
    }
    string_array(obj, "creator_id", false)?;
    if required(obj, "creator_id")?.as_array().is_some_and(Vec::is_empty) {
        return Err(ValidationError::new("creator_id", "at least one creator required"));
    }
    optional_string(obj, "code")?;
    string(obj, "name")?;
    string_array(obj, "groups", false)?;
    string_array(obj, "tags", true)?;
    string(obj, "desc")?;
    non_empty(obj, "location_id")?;
    non_empty(obj, "room_id")?;
    timestamp(obj, "start_date")?;
    timestamp(obj, "end_date")?;
    non_negative_int(obj, "max_tick")?;
    optional_string(obj, "img_url")?;
    if let Some(url) = obj.get("img_url").and_then(Value::as_str)
        && !is_url_or_empty(url)
    {
        return Err(ValidationError::new("img_url", "not a URL"));
    }
    let mut v = v;
    if let Some(obj) = v.as_object_mut() {
        obj.remove("tickets_reserved");
        obj.remove("pending");
    }
    typed(v, "event")
}

/// Validate a location creation request and convert it. Client-supplied
/// `events_ids` are accepted by shape but dropped: back-references are engine-owned.
pub fn location_input(v: Value) -> Result<NewLocation, ValidationError> {
    let obj = object(&v, "location")?;
    if obj.contains_key("location_id") {
        non_empty(obj, "location_id")?;
    }
    non_empty(obj, "location_name")?;
    let rooms = required(obj, "rooms")?
        .as_array()
        .ok_or_else(|| ValidationError::new("rooms", "expected an array"))?;
    for (i, room) in rooms.iter().enumerate() {
        validate_room(room, i)?;
    }
    let mut v = v;
    if let Some(obj) = v.as_object_mut() {
        obj.remove("events_ids");
        if let Some(Value::Array(rooms)) = obj.get_mut("rooms") {
            for room in rooms.iter_mut().filter_map(Value::as_object_mut) {
                room.remove("events_ids");
            }
        }
    }
    typed(v, "location")
}

fn validate_room(v: &Value, index: usize) -> Result<(), ValidationError> {
    let field = |name: &str| format!("rooms[{index}].{name}");
    let room = v
        .as_object()
        .ok_or_else(|| ValidationError::new(format!("rooms[{index}]"), "expected a JSON object"))?;
    if let Some(unknown) = room.keys().find(|k| !ROOM_FIELDS.contains(&k.as_str())) {
        return Err(ValidationError::new(field(unknown.as_str()), "unknown room property"));
    }
    string(room, "room_name").map_err(|e| ValidationError::new(field("room_name"), e.reason))?;
    non_negative_int(room, "capacity")
        .map_err(|e| ValidationError::new(field("capacity"), e.reason))?;
    optional_string(room, "room_id").map_err(|e| ValidationError::new(field("room_id"), e.reason))?;
    optional_string(room, "description")
        .map_err(|e| ValidationError::new(field("description"), e.reason))?;
    Ok(())
}

/// Validate a user creation request and convert it. `auth` is normalised to a
/// JSON boolean; the source schema declares it with the non-standard type `"bool"`.
pub fn user_input(v: Value) -> Result<NewUser, ValidationError> {
    let mut v = v;
    let obj = v
        .as_object_mut()
        .ok_or_else(|| ValidationError::new("user", "expected a JSON object"))?;
    normalize_auth(obj)?;
    let obj = &*obj;
    if obj.contains_key("user_id") {
        non_empty(obj, "user_id")?;
    }
    if !is_ipv4(string(obj, "IP")?) {
        return Err(ValidationError::new("IP", "expected a dotted-quad IPv4 address"));
    }
    if !is_email(string(obj, "email")?) {
        return Err(ValidationError::new("email", "not an email address"));
    }
    non_empty(obj, "password")?;
    string_array(obj, "groups", false)?;
    typed(v, "user")
}

fn normalize_auth(obj: &mut Map<String, Value>) -> Result<(), ValidationError> {
    let normalized = match obj.get("auth") {
        None => return Err(ValidationError::new("auth", "missing mandatory field")),
        Some(Value::Bool(b)) => *b,
        Some(Value::String(s)) if s == "true" => true,
        Some(Value::String(s)) if s == "false" => false,
        Some(_) => return Err(ValidationError::new("auth", "expected a boolean")),
    };
    obj.insert("auth".into(), Value::Bool(normalized));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event() -> Value {
        json!({
            "creator_id": ["u1"],
            "name": "Launch",
            "groups": [],
            "desc": "Product launch",
            "location_id": "loc",
            "room_id": "room",
            "start_date": "2025-06-01T10:00:00Z",
            "end_date": "2025-06-01T12:00:00.250Z",
            "max_tick": 30,
            "img_url": "",
            "sponsor": "acme"
        })
    }

    #[test]
    fn timestamps() {
        assert!(is_iso_utc("2025-06-01T10:00:00Z"));
        assert!(is_iso_utc("2025-06-01T10:00:00.123456Z"));
        assert!(!is_iso_utc("2025-06-01T10:00:00+02:00"));
        assert!(!is_iso_utc("2025-06-01 10:00:00Z"));
        assert!(!is_iso_utc("2025-13-01T10:00:00Z"));
    }

    #[test]
    fn ipv4_is_strict() {
        assert!(is_ipv4("192.168.0.1"));
        assert!(!is_ipv4("192.168.0"));
        assert!(!is_ipv4("256.1.1.1"));
        assert!(!is_ipv4("::1"));
    }

    #[test]
    fn urls() {
        assert!(is_url_or_empty(""));
        assert!(is_url_or_empty("https://cdn.example.com/img/a.png"));
        assert!(is_url_or_empty("example.org"));
        assert!(!is_url_or_empty("not a url"));
    }

    #[test]
    fn event_input_accepts_open_fields() {
        let e = event_input(event()).unwrap();
        assert_eq!(e.max_tick, 30);
        assert_eq!(e.extra.get("sponsor"), Some(&json!("acme")));
        assert_eq!(e.event_id, None);
    }

    #[test]
    fn event_input_drops_engine_owned_state() {
        let mut v = event();
        v["tickets_reserved"] = json!(7);
        v["pending"] = json!({"op": "create", "since": 1});
        let e = event_input(v).unwrap();
        assert!(!e.extra.contains_key("tickets_reserved"));
        assert!(!e.extra.contains_key("pending"));
        assert_eq!(e.extra.get("sponsor"), Some(&json!("acme")));
    }

    #[test]
    fn event_input_rejects_bad_fields() {
        let mut v = event();
        v["start_date"] = json!("yesterday");
        assert_eq!(event_input(v).unwrap_err().field, "start_date");

        let mut v = event();
        v["max_tick"] = json!(-1);
        assert_eq!(event_input(v).unwrap_err().field, "max_tick");

        let mut v = event();
        v["creator_id"] = json!([]);
        assert_eq!(event_input(v).unwrap_err().field, "creator_id");

        let mut v = event();
        v.as_object_mut().unwrap().remove("room_id");
        assert_eq!(event_input(v).unwrap_err().field, "room_id");
    }

    #[test]
    fn location_input_closed_rooms() {
        let v = json!({
            "location_name": "Hall",
            "rooms": [{"room_name": "A", "capacity": 10, "wifi": true}],
            "address": "Main St 1"
        });
        let err = location_input(v).unwrap_err();
        assert_eq!(err.field, "rooms[0].wifi");
    }

    #[test]
    fn location_input_drops_client_back_references() {
        let v = json!({
            "location_name": "Hall",
            "events_ids": [{"event_id": "forged"}],
            "rooms": [{"room_name": "A", "capacity": 10, "events_ids": [{"event_id": "forged"}]}],
            "address": "Main St 1"
        });
        let loc = location_input(v).unwrap();
        assert!(!loc.extra.contains_key("events_ids"));
        assert_eq!(loc.extra.get("address"), Some(&json!("Main St 1")));
        assert_eq!(loc.rooms[0].capacity, 10);
    }

    #[test]
    fn location_room_requires_capacity() {
        let v = json!({"location_name": "Hall", "rooms": [{"room_name": "A"}]});
        assert_eq!(location_input(v).unwrap_err().field, "rooms[0].capacity");
    }

    #[test]
    fn user_auth_normalized() {
        let v = json!({
            "IP": "10.0.0.7", "email": "ann@example.com", "auth": "true",
            "password": "pw", "groups": ["admins"]
        });
        let u = user_input(v).unwrap();
        assert!(u.auth);

        let v = json!({
            "IP": "10.0.0.7", "email": "ann@example.com", "auth": 1,
            "password": "pw", "groups": []
        });
        assert_eq!(user_input(v).unwrap_err().field, "auth");
    }

    #[test]
    fn user_email_and_ip_checked() {
        let v = json!({
            "IP": "10.0.0", "email": "ann@example.com", "auth": true,
            "password": "pw", "groups": []
        });
        assert_eq!(user_input(v).unwrap_err().field, "IP");

        let v = json!({
            "IP": "10.0.0.1", "email": "ann-at-example", "auth": true,
            "password": "pw", "groups": []
        });
        assert_eq!(user_input(v).unwrap_err().field, "email");
    }
}
