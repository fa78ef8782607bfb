use std::collections::{BTreeSet, HashSet};

use dashmap::DashMap;

use crate::model::LocationDoc;

/// In-memory mirror of the back-references held by location documents.
///
/// Answers "which events are booked here" without reading the location.
/// Every mutation is idempotent; the store stays the source of truth and
/// [`ReferenceIndex::load_location`] resynchronizes from it.
#[derive(Default)]
pub struct ReferenceIndex {
    rooms: DashMap<(String, String), HashSet<String>>,
    locations: DashMap<String, HashSet<String>>,
}

impl ReferenceIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, location_id: &str, room_id: &str, event_id: &str) {
        self.rooms
            .entry((location_id.to_string(), room_id.to_string()))
            .or_default()
            .insert(event_id.to_string());
        self.locations
            .entry(location_id.to_string())
            .or_default()
            .insert(event_id.to_string());
    }

    pub fn remove(&self, location_id: &str, room_id: &str, event_id: &str) {
        if let Some(mut set) = self
            .rooms
            .get_mut(&(location_id.to_string(), room_id.to_string()))
        {
            set.remove(event_id);
        }
        if let Some(mut set) = self.locations.get_mut(location_id) {
            set.remove(event_id);
        }
    }

    /// Events linked to a location, or to one of its rooms. Empty if unknown.
    pub fn events_in(&self, location_id: &str, room_id: Option<&str>) -> BTreeSet<String> {
        let collect = |set: &HashSet<String>| set.iter().cloned().collect::<BTreeSet<_>>();
        match room_id {
            Some(room_id) => self
                .rooms
                .get(&(location_id.to_string(), room_id.to_string()))
                .map(|s| collect(&s))
                .unwrap_or_default(),
            None => self
                .locations
                .get(location_id)
                .map(|s| collect(&s))
                .unwrap_or_default(),
        }
    }

    pub fn contains_location(&self, location_id: &str) -> bool {
        self.locations.contains_key(location_id)
    }

    /// Replace everything known about a location with its document's arrays.
    pub fn load_location(&self, location: &LocationDoc) {
        self.forget_location(&location.location_id);
        let building: HashSet<String> =
            location.events_ids.iter().map(|r| r.event_id.clone()).collect();
        self.locations.insert(location.location_id.clone(), building);
        for room in &location.rooms {
            let set: HashSet<String> = room.events_ids.iter().map(|r| r.event_id.clone()).collect();
            self.rooms
                .insert((location.location_id.clone(), room.room_id.clone()), set);
        }
    }

    pub fn forget_location(&self, location_id: &str) {
        self.locations.remove(location_id);
        self.rooms.retain(|(loc, _), _| loc != location_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EventRef, RoomDoc};
    use serde_json::Map;

    #[test]
    fn add_is_idempotent() {
        let index = ReferenceIndex::new();
        index.add("L", "R", "e1");
        index.add("L", "R", "e1");
        assert_eq!(index.events_in("L", Some("R")).len(), 1);
        assert_eq!(index.events_in("L", None).len(), 1);
    }

    #[test]
    fn remove_is_idempotent() {
        let index = ReferenceIndex::new();
        index.add("L", "R", "e1");
        index.remove("L", "R", "e1");
        index.remove("L", "R", "e1");
        index.remove("nowhere", "R", "e1");
        assert!(index.events_in("L", Some("R")).is_empty());
        assert!(index.events_in("L", None).is_empty());
    }

    #[test]
    fn unknown_location_is_empty() {
        let index = ReferenceIndex::new();
        assert!(index.events_in("L", None).is_empty());
        assert!(!index.contains_location("L"));
    }

    #[test]
    fn load_location_replaces_previous_state() {
        let index = ReferenceIndex::new();
        index.add("L", "old-room", "stale");
        let doc = LocationDoc {
            location_id: "L".into(),
            location_name: "Hall".into(),
            events_ids: vec![EventRef::new("e1"), EventRef::new("e2")],
            rooms: vec![
                RoomDoc {
                    room_id: "A".into(),
                    room_name: "A".into(),
                    capacity: 10,
                    events_ids: vec![EventRef::new("e1")],
                    description: None,
                },
                RoomDoc {
                    room_id: "B".into(),
                    room_name: "B".into(),
                    capacity: 10,
                    events_ids: vec![EventRef::new("e2")],
                    description: None,
                },
            ],
            extra: Map::new(),
        };
        index.load_location(&doc);
        assert!(index.events_in("L", Some("old-room")).is_empty());
        assert_eq!(
            index.events_in("L", None),
            BTreeSet::from(["e1".to_string(), "e2".to_string()])
        );
        assert_eq!(index.events_in("L", Some("B")), BTreeSet::from(["e2".to_string()]));

        index.forget_location("L");
        assert!(!index.contains_location("L"));
        assert!(index.events_in("L", Some("A")).is_empty());
    }
}
