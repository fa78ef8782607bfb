mod catalog;
mod consistency;
mod error;
mod index;
mod placement;
mod queries;
mod repair;
mod retry;
mod tickets;

pub use error::{CapacityConflict, EngineError, EntityRef};
pub use index::ReferenceIndex;
pub use placement::peak_demand;
pub use repair::RepairReport;
pub use retry::{Deadline, RetryPolicy};

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::sync::{broadcast, Mutex, OwnedMutexGuard};

use crate::model::*;
use crate::notify::NotifyHub;
use crate::store::{Doc, DocKey, DocumentStore, Versioned};

use placement::Occupant;

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub policy: BookingPolicy,
    pub retry: RetryPolicy,
    /// Pending markers younger than this belong to an operation that may
    /// still be running; reconciliation leaves them alone.
    pub pending_grace: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            policy: BookingPolicy::default(),
            retry: RetryPolicy::default(),
            pending_grace: Duration::from_secs(30),
        }
    }
}

pub struct Engine {
    store: Arc<dyn DocumentStore>,
    index: ReferenceIndex,
    pub notify: Arc<NotifyHub>,
    config: EngineConfig,
    /// Serializes placement writes per location inside this process. Writers
    /// in other processes are still caught by versioned writes.
    location_gates: DashMap<String, Arc<Mutex<()>>>,
}

impl Engine {
    pub async fn new(
        store: Arc<dyn DocumentStore>,
        notify: Arc<NotifyHub>,
        config: EngineConfig,
    ) -> Result<Self, EngineError> {
        let engine = Self {
            store,
            index: ReferenceIndex::new(),
            notify,
            config,
            location_gates: DashMap::new(),
        };
        engine.rebuild_index().await?;
        Ok(engine)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn index(&self) -> &ReferenceIndex {
        &self.index
    }

    pub fn subscribe(&self, location_id: &str) -> broadcast::Receiver<PlacementChange> {
        self.notify.subscribe(location_id)
    }

    /// Reload the reference index from every stored location.
    pub async fn rebuild_index(&self) -> Result<(), EngineError> {
        let locations = self.store.scan(crate::store::Collection::Locations).await?;
        for v in locations {
            if let Doc::Location(loc) = v.doc {
                self.index.load_location(&loc);
            }
        }
        Ok(())
    }

    // ── Loading ──────────────────────────────────────────────────

    pub(super) async fn load_event(&self, id: &str) -> Result<Versioned<EventDoc>, EngineError> {
        match self.store.get(&DocKey::event(id)).await? {
            Some(Versioned { doc: Doc::Event(doc), version }) => Ok(Versioned { doc, version }),
            _ => Err(EngineError::NotFound(EntityRef::Event(id.to_string()))),
        }
    }

    pub(super) async fn load_location(
        &self,
        id: &str,
    ) -> Result<Versioned<LocationDoc>, EngineError> {
        match self.store.get(&DocKey::location(id)).await? {
            Some(Versioned { doc: Doc::Location(doc), version }) => Ok(Versioned { doc, version }),
            _ => Err(EngineError::NotFound(EntityRef::Location(id.to_string()))),
        }
    }

    pub(super) async fn load_user(&self, id: &str) -> Result<Versioned<UserDoc>, EngineError> {
        match self.store.get(&DocKey::user(id)).await? {
            Some(Versioned { doc: Doc::User(doc), version }) => Ok(Versioned { doc, version }),
            _ => Err(EngineError::NotFound(EntityRef::User(id.to_string()))),
        }
    }

    /// Everything currently holding time in a room, other than `exclude`.
    ///
    /// Reads each linked event. An event still mid-move into this room is
    /// counted at its destination window too.
    pub(super) async fn occupants(
        &self,
        location: &LocationDoc,
        room_id: &str,
        exclude: &str,
    ) -> Result<Vec<Occupant>, EngineError> {
        let room = placement::room_of(location, room_id)?;
        let ids: Vec<&str> = room
            .events_ids
            .iter()
            .map(|r| r.event_id.as_str())
            .filter(|id| *id != exclude)
            .collect();
        let store = &self.store;
        let docs = futures::future::try_join_all(
            ids.iter()
                .map(|id| async move { store.get(&DocKey::event(*id)).await }),
        )
        .await?;

        let mut out = Vec::new();
        for found in docs.into_iter().flatten() {
            let Doc::Event(ev) = found.doc else { continue };
            if ev.location_id == location.location_id && ev.room_id == room_id {
                out.push(Occupant {
                    event_id: ev.event_id.clone(),
                    span: ev.span(),
                    demand: ev.max_tick,
                });
            }
            if let Some(Pending { op: PendingOp::Move { to }, .. }) = &ev.pending
                && to.location_id == location.location_id
                && to.room_id == room_id
            {
                out.push(Occupant {
                    event_id: ev.event_id.clone(),
                    span: to.span(),
                    demand: ev.max_tick,
                });
            }
        }
        Ok(out)
    }

    /// Take the in-process gates for `location_ids` in sorted order.
    pub(super) async fn lock_locations(
        &self,
        op: &'static str,
        location_ids: &[&str],
        deadline: Deadline,
    ) -> Result<Vec<OwnedMutexGuard<()>>, EngineError> {
        let mut ids: Vec<&str> = location_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            let gate = self
                .location_gates
                .entry(id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone();
            let guard = match deadline.remaining() {
                Some(left) => tokio::time::timeout(left, gate.lock_owned())
                    .await
                    .map_err(|_| EngineError::Timeout { op, attempts: 0 })?,
                None => gate.lock_owned().await,
            };
            guards.push(guard);
        }
        Ok(guards)
    }
}

/// Record metrics for a finished public operation and pass its result through.
pub(super) fn finish<T>(
    op: &'static str,
    started: Instant,
    result: Result<T, EngineError>,
) -> Result<T, EngineError> {
    let status = match &result {
        Ok(_) => "ok",
        Err(e) => e.label(),
    };
    crate::observability::record_operation(op, status, started);
    if let Err(e) = &result {
        tracing::debug!("{op} failed: {e}");
    }
    result
}
