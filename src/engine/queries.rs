use std::collections::BTreeSet;

use crate::model::*;
use crate::store::{Collection, Doc};

use super::{placement, Engine, EngineError};

impl Engine {
    pub async fn get_event(&self, event_id: &str) -> Result<EventDoc, EngineError> {
        self.load_event(event_id).await.map(|v| v.doc)
    }

    pub async fn get_location(&self, location_id: &str) -> Result<LocationDoc, EngineError> {
        self.load_location(location_id).await.map(|v| v.doc)
    }

    pub async fn get_user(&self, user_id: &str) -> Result<UserDoc, EngineError> {
        self.load_user(user_id).await.map(|v| v.doc)
    }

    /// All locations, ordered by id.
    pub async fn list_locations(&self) -> Result<Vec<LocationDoc>, EngineError> {
        let docs = self.store.scan(Collection::Locations).await?;
        Ok(docs
            .into_iter()
            .filter_map(|v| match v.doc {
                Doc::Location(l) => Some(l),
                _ => None,
            })
            .collect())
    }

    /// Events booked in a location, or in one of its rooms.
    ///
    /// Other writers share the store but not this index, so the location is
    /// read first and the index entry refreshed from its arrays.
    pub async fn events_in(
        &self,
        location_id: &str,
        room_id: Option<&str>,
    ) -> Result<BTreeSet<String>, EngineError> {
        let loc = match self.load_location(location_id).await {
            Ok(v) => v.doc,
            Err(e) => {
                self.index.forget_location(location_id);
                return Err(e);
            }
        };
        if let Some(room_id) = room_id {
            placement::room_of(&loc, room_id)?;
        }
        self.index.load_location(&loc);
        Ok(self.index.events_in(location_id, room_id))
    }

    /// Tickets still available for an event. Zero once it is being deleted.
    pub async fn available_tickets(&self, event_id: &str) -> Result<u32, EngineError> {
        let ev = self.load_event(event_id).await?.doc;
        if ev.is_pending_delete() {
            return Ok(0);
        }
        Ok(ev.remaining_tickets())
    }
}
