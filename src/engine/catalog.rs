//! Location, room and user lifecycle.

use std::collections::HashSet;
use std::time::Instant;

use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{Collection, Doc, DocKey, Expect, StoreError};
use crate::validate::{self, ValidationError};

use super::placement::{self, peak_overall};
use super::retry::with_retry;
use super::{finish, CapacityConflict, Deadline, Engine, EngineError, EntityRef};

fn non_empty(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.trim().is_empty() {
        return Err(ValidationError::new(field, "must not be empty").into());
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

fn build_room(new: NewRoom, field: &str) -> Result<RoomDoc, EngineError> {
    non_empty(&format!("{field}.room_name"), &new.room_name, MAX_NAME_LEN)?;
    let room_id = match new.room_id {
        Some(id) => {
            non_empty(&format!("{field}.room_id"), &id, MAX_ID_LEN)?;
            id
        }
        None => Ulid::new().to_string(),
    };
    if new.description.as_ref().is_some_and(|d| d.len() > MAX_DESC_LEN) {
        return Err(EngineError::LimitExceeded("room description too long"));
    }
    Ok(RoomDoc {
        room_id,
        room_name: new.room_name,
        capacity: new.capacity,
        events_ids: Vec::new(),
        description: new.description,
    })
}

impl Engine {
    // ── Locations ────────────────────────────────────────────────

    /// Store a new location. Ids are generated where missing and
    /// back-reference arrays always start empty.
    pub async fn create_location(&self, new: NewLocation) -> Result<LocationDoc, EngineError> {
        let started = Instant::now();
        let result = self.create_location_inner(new).await;
        finish("create_location", started, result)
    }

    async fn create_location_inner(&self, new: NewLocation) -> Result<LocationDoc, EngineError> {
        non_empty("location_name", &new.location_name, MAX_NAME_LEN)?;
        if new.rooms.len() > MAX_ROOMS_PER_LOCATION {
            return Err(EngineError::LimitExceeded("too many rooms"));
        }
        let location_id = match new.location_id {
            Some(id) => {
                non_empty("location_id", &id, MAX_ID_LEN)?;
                id
            }
            None => Ulid::new().to_string(),
        };

        let mut rooms = Vec::with_capacity(new.rooms.len());
        let mut ids = HashSet::new();
        for (i, room) in new.rooms.into_iter().enumerate() {
            let room = build_room(room, &format!("rooms[{i}]"))?;
            if !ids.insert(room.room_id.clone()) {
                return Err(ValidationError::new(format!("rooms[{i}].room_id"), "duplicate room id").into());
            }
            rooms.push(room);
        }

        self.ensure_name_free(&new.location_name, None).await?;
        let mut extra = new.extra;
        let dropped = drop_declared(&mut extra, &LOCATION_FIELDS);
        if !dropped.is_empty() {
            warn!("create_location: ignoring engine-owned properties {dropped:?} on {location_id}");
        }
        let doc = LocationDoc {
            location_id,
            location_name: new.location_name,
            events_ids: Vec::new(),
            rooms,
            extra,
        };
        match self.store.put(Doc::Location(doc.clone()), Expect::Absent).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(EngineError::AlreadyExists(EntityRef::Location(doc.location_id)));
            }
            Err(e) => return Err(e.into()),
        }
        self.index.load_location(&doc);
        info!("location {} ({}) created with {} room(s)", doc.location_id, doc.location_name, doc.rooms.len());
        Ok(doc)
    }

    pub async fn rename_location(
        &self,
        location_id: &str,
        name: &str,
        deadline: Deadline,
    ) -> Result<LocationDoc, EngineError> {
        let started = Instant::now();
        let result = async {
            non_empty("location_name", name, MAX_NAME_LEN)?;
            self.ensure_name_free(name, Some(location_id)).await?;
            self.modify_location("rename_location", location_id, deadline, |loc| {
                loc.location_name = name.to_string();
                Ok(())
            })
            .await
            .map(|(_, loc)| loc)
        }
        .await;
        finish("rename_location", started, result)
    }

    pub async fn add_room(
        &self,
        location_id: &str,
        new: NewRoom,
        deadline: Deadline,
    ) -> Result<RoomDoc, EngineError> {
        let started = Instant::now();
        let result = async {
            let room = build_room(new, "room")?;
            self.modify_location("add_room", location_id, deadline, |loc| {
                if loc.rooms.len() >= MAX_ROOMS_PER_LOCATION {
                    return Err(EngineError::LimitExceeded("too many rooms"));
                }
                if loc.room(&room.room_id).is_some() {
                    return Err(EngineError::AlreadyExists(EntityRef::Room {
                        location_id: location_id.to_string(),
                        room_id: room.room_id.clone(),
                    }));
                }
                loc.rooms.push(room.clone());
                Ok(room.clone())
            })
            .await
            .map(|(room, _)| room)
        }
        .await;
        finish("add_room", started, result)
    }

    /// Edit a room's name, capacity or description. Under the shared policy
    /// capacity cannot drop below the peak headcount already booked there.
    pub async fn update_room(
        &self,
        location_id: &str,
        room_id: &str,
        patch: RoomPatch,
        deadline: Deadline,
    ) -> Result<RoomDoc, EngineError> {
        let started = Instant::now();
        let result = self.update_room_inner(location_id, room_id, &patch, deadline).await;
        finish("update_room", started, result)
    }

    async fn update_room_inner(
        &self,
        location_id: &str,
        room_id: &str,
        patch: &RoomPatch,
        deadline: Deadline,
    ) -> Result<RoomDoc, EngineError> {
        if let Some(name) = &patch.room_name {
            non_empty("room_name", name, MAX_NAME_LEN)?;
        }
        let _gates = self.lock_locations("update_room", &[location_id], deadline).await?;
        with_retry("update_room", &self.config.retry, deadline, |_| async move {
            let loc = self.load_location(location_id).await?;
            let room = placement::room_of(&loc.doc, room_id)?;

            if let Some(capacity) = patch.capacity
                && capacity < room.capacity
                && self.config.policy == BookingPolicy::SharedByHeadcount
            {
                let occupants = self.occupants(&loc.doc, room_id, "").await?;
                let peak = peak_overall(&occupants);
                if peak > capacity as u64 {
                    return Err(EngineError::Capacity(CapacityConflict::HeadcountExceeded {
                        location_id: location_id.to_string(),
                        room_id: room_id.to_string(),
                        capacity,
                        demand: peak,
                    }));
                }
            }

            let mut updated = loc.doc.clone();
            let Some(room) = updated.room_mut(room_id) else {
                return Err(EngineError::NotFound(EntityRef::Room {
                    location_id: location_id.to_string(),
                    room_id: room_id.to_string(),
                }));
            };
            if let Some(name) = &patch.room_name {
                room.room_name = name.clone();
            }
            if let Some(capacity) = patch.capacity {
                room.capacity = capacity;
            }
            if let Some(description) = &patch.description {
                room.description = Some(description.clone());
            }
            let room = room.clone();
            self.store
                .put(Doc::Location(updated), Expect::Version(loc.version))
                .await?;
            Ok(room)
        })
        .await
    }

    pub async fn remove_room(
        &self,
        location_id: &str,
        room_id: &str,
        deadline: Deadline,
    ) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = async {
            let _gates = self.lock_locations("remove_room", &[location_id], deadline).await?;
            let (_, loc) = self
                .modify_location("remove_room", location_id, deadline, |loc| {
                    let room = placement::room_of(loc, room_id)?;
                    if !room.events_ids.is_empty() {
                        return Err(EngineError::HasEvents {
                            location_id: location_id.to_string(),
                            room_id: Some(room_id.to_string()),
                            count: room.events_ids.len(),
                        });
                    }
                    loc.rooms.retain(|r| r.room_id != room_id);
                    Ok(())
                })
                .await?;
            self.index.load_location(&loc);
            Ok(())
        }
        .await;
        finish("remove_room", started, result)
    }

    /// Delete a location that holds no events.
    pub async fn delete_location(&self, location_id: &str, deadline: Deadline) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = async {
            let _gates = self.lock_locations("delete_location", &[location_id], deadline).await?;
            with_retry("delete_location", &self.config.retry, deadline, |_| async move {
                let loc = self.load_location(location_id).await?;
                let mut held: HashSet<&str> =
                    loc.doc.events_ids.iter().map(|r| r.event_id.as_str()).collect();
                for room in &loc.doc.rooms {
                    held.extend(room.events_ids.iter().map(|r| r.event_id.as_str()));
                }
                if !held.is_empty() {
                    return Err(EngineError::HasEvents {
                        location_id: location_id.to_string(),
                        room_id: None,
                        count: held.len(),
                    });
                }
                self.store
                    .delete(&DocKey::location(location_id), Expect::Version(loc.version))
                    .await?;
                Ok(())
            })
            .await?;
            self.index.forget_location(location_id);
            self.notify.remove(location_id);
            info!("location {location_id} deleted");
            Ok(())
        }
        .await;
        finish("delete_location", started, result)
    }

    /// Read-modify-write of a location document under its version.
    async fn modify_location<R, F>(
        &self,
        op: &'static str,
        location_id: &str,
        deadline: Deadline,
        edit: F,
    ) -> Result<(R, LocationDoc), EngineError>
    where
        F: Fn(&mut LocationDoc) -> Result<R, EngineError>,
    {
        let edit = &edit;
        with_retry(op, &self.config.retry, deadline, |_| async move {
            let loc = self.load_location(location_id).await?;
            let mut updated = loc.doc;
            let out = edit(&mut updated)?;
            self.store
                .put(Doc::Location(updated.clone()), Expect::Version(loc.version))
                .await?;
            Ok((out, updated))
        })
        .await
    }

    async fn ensure_name_free(&self, name: &str, except: Option<&str>) -> Result<(), EngineError> {
        for v in self.store.scan(Collection::Locations).await? {
            if let Doc::Location(loc) = v.doc
                && loc.location_name == name
                && except != Some(loc.location_id.as_str())
            {
                return Err(EngineError::AlreadyExists(EntityRef::Location(loc.location_id)));
            }
        }
        Ok(())
    }

    // ── Users ────────────────────────────────────────────────────

    pub async fn create_user(&self, new: NewUser) -> Result<UserDoc, EngineError> {
        let started = Instant::now();
        let result = self.create_user_inner(new).await;
        finish("create_user", started, result)
    }

    async fn create_user_inner(&self, new: NewUser) -> Result<UserDoc, EngineError> {
        if !validate::is_ipv4(&new.ip) {
            return Err(ValidationError::new("IP", "not a dotted-quad IPv4 address").into());
        }
        if !validate::is_email(&new.email) {
            return Err(ValidationError::new("email", "not an email address").into());
        }
        if new.password.is_empty() {
            return Err(ValidationError::new("password", "must not be empty").into());
        }
        let user_id = match new.user_id {
            Some(id) => {
                non_empty("user_id", &id, MAX_ID_LEN)?;
                id
            }
            None => Ulid::new().to_string(),
        };
        for v in self.store.scan(Collection::Users).await? {
            if let Doc::User(u) = v.doc
                && u.email.eq_ignore_ascii_case(&new.email)
            {
                return Err(EngineError::AlreadyExists(EntityRef::User(u.user_id)));
            }
        }

        let mut extra = new.extra;
        drop_declared(&mut extra, &USER_FIELDS);
        let user = UserDoc {
            user_id,
            ip: new.ip,
            email: new.email,
            auth: new.auth,
            password: new.password,
            groups: new.groups,
            extra,
        };
        match self.store.put(Doc::User(user.clone()), Expect::Absent).await {
            Ok(_) => {}
            Err(StoreError::Conflict(_)) => {
                return Err(EngineError::AlreadyExists(EntityRef::User(user.user_id)));
            }
            Err(e) => return Err(e.into()),
        }
        info!("user {} created", user.user_id);
        Ok(user)
    }
}
