//! Event placement: create, relocate, reschedule, delete.
//!
//! Each mutation runs as one store transaction when the store offers them.
//! Otherwise it runs as an ordered two-phase write: mark the event pending,
//! rewrite the back-references, clear the marker. An interrupted sequence
//! leaves a marker that [`Engine::repair_references`] knows how to finish or
//! undo.

use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{info, warn};
use ulid::Ulid;

use crate::limits::*;
use crate::model::*;
use crate::store::{Doc, DocKey, Expect, StoreError, Version, Versioned, WriteOp};
use crate::validate::{self, ValidationError};

use super::placement::{self, check_placement, now_ms, validate_window};
use super::retry::with_retry;
use super::{finish, Deadline, Engine, EngineError, EntityRef};

/// Where a move sends an event, relative to its current placement.
#[derive(Debug, Clone, Copy)]
enum Target<'a> {
    Room { location_id: &'a str, room_id: &'a str },
    Window { start: DateTime<Utc>, end: DateTime<Utc> },
}

impl Target<'_> {
    fn apply(&self, from: &Placement) -> Placement {
        match *self {
            Target::Room { location_id, room_id } => Placement {
                location_id: location_id.to_string(),
                room_id: room_id.to_string(),
                ..from.clone()
            },
            Target::Window { start, end } => Placement {
                start_date: start,
                end_date: end,
                ..from.clone()
            },
        }
    }
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), EngineError> {
    if value.is_empty() {
        return Err(ValidationError::new(field, "must not be empty").into());
    }
    if value.len() > max {
        return Err(EngineError::LimitExceeded("field too long"));
    }
    Ok(())
}

impl Engine {
    // ── Create ───────────────────────────────────────────────────

    pub async fn create_event(
        &self,
        new: NewEvent,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let started = Instant::now();
        let result = self.create_event_inner(new, deadline).await;
        finish("create_event", started, result)
    }

    async fn create_event_inner(
        &self,
        new: NewEvent,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let doc = self.prepare_event(new).await?;
        let _gates = self
            .lock_locations("create_event", &[doc.location_id.as_str()], deadline)
            .await?;

        if self.store.supports_transactions() {
            let doc = &doc;
            with_retry("create_event", &self.config.retry, deadline, |_| {
                self.try_create_tx(doc)
            })
            .await?;
        } else {
            self.create_two_phase(&doc, deadline).await?;
        }

        self.index.add(&doc.location_id, &doc.room_id, &doc.event_id);
        self.notify.send(
            &doc.location_id,
            PlacementChange::EventPlaced {
                event_id: doc.event_id.clone(),
                room_id: doc.room_id.clone(),
            },
        );
        info!(
            "event {} placed in {}/{}",
            doc.event_id, doc.location_id, doc.room_id
        );
        Ok(doc)
    }

    /// Input checks that need no placement decision. Nothing is written.
    async fn prepare_event(&self, new: NewEvent) -> Result<EventDoc, EngineError> {
        let event_id = match new.event_id {
            Some(id) => {
                check_len("event_id", &id, MAX_ID_LEN)?;
                id
            }
            None => Ulid::new().to_string(),
        };
        check_len("name", &new.name, MAX_NAME_LEN)?;
        check_len("location_id", &new.location_id, MAX_ID_LEN)?;
        check_len("room_id", &new.room_id, MAX_ID_LEN)?;
        if new.desc.len() > MAX_DESC_LEN {
            return Err(EngineError::LimitExceeded("desc too long"));
        }
        if new.creator_id.is_empty() {
            return Err(ValidationError::new("creator_id", "needs at least one creator").into());
        }
        if new.creator_id.len() > MAX_CREATORS_PER_EVENT {
            return Err(EngineError::LimitExceeded("too many creators"));
        }
        if let Some(url) = &new.img_url
            && !validate::is_url_or_empty(url)
        {
            return Err(ValidationError::new("img_url", "not a URL").into());
        }
        validate_window(new.start_date, new.end_date)?;
        for creator in &new.creator_id {
            self.load_user(creator).await?;
        }
        let mut extra = new.extra;
        let dropped = drop_declared(&mut extra, &EVENT_FIELDS);
        if !dropped.is_empty() {
            warn!("create_event: ignoring engine-owned properties {dropped:?} on {event_id}");
        }

        Ok(EventDoc {
            event_id,
            creator_id: new.creator_id,
            code: new.code,
            name: new.name,
            groups: new.groups,
            tags: new.tags,
            desc: new.desc,
            location_id: new.location_id,
            room_id: new.room_id,
            start_date: new.start_date,
            end_date: new.end_date,
            max_tick: new.max_tick,
            tickets_reserved: 0,
            img_url: new.img_url,
            pending: None,
            extra,
        })
    }

    async fn try_create_tx(&self, doc: &EventDoc) -> Result<(), EngineError> {
        if self.store.get(&DocKey::event(&doc.event_id)).await?.is_some() {
            return Err(EngineError::AlreadyExists(EntityRef::Event(doc.event_id.clone())));
        }
        let loc = self.load_location(&doc.location_id).await?;
        self.validate_in_room(&loc.doc, &doc.room_id, &doc.event_id, doc.span(), doc.max_tick)
            .await?;

        let mut linked = loc.doc;
        linked.link_event(&doc.room_id, &doc.event_id);
        self.store
            .transaction(vec![
                WriteOp::Put { doc: Doc::Event(doc.clone()), expect: Expect::Absent },
                WriteOp::Put { doc: Doc::Location(linked), expect: Expect::Version(loc.version) },
            ])
            .await?;
        Ok(())
    }

    async fn create_two_phase(&self, doc: &EventDoc, deadline: Deadline) -> Result<(), EngineError> {
        // Fail fast before anything is written.
        let loc = self.load_location(&doc.location_id).await?;
        self.validate_in_room(&loc.doc, &doc.room_id, &doc.event_id, doc.span(), doc.max_tick)
            .await?;

        let mut marked = doc.clone();
        marked.pending = Some(Pending { op: PendingOp::Create, since: now_ms() });
        let version = match self.store.put(Doc::Event(marked), Expect::Absent).await {
            Ok(v) => v,
            Err(StoreError::Conflict(_)) => {
                return Err(EngineError::AlreadyExists(EntityRef::Event(doc.event_id.clone())));
            }
            Err(e) => return Err(e.into()),
        };

        let to = doc.placement();
        let linked = with_retry("create_event", &self.config.retry, deadline, |_| {
            self.try_link(&doc.event_id, &to, doc.max_tick)
        })
        .await;
        if let Err(e) = linked {
            let key = DocKey::event(&doc.event_id);
            if let Err(undo) = self.store.delete(&key, Expect::Version(version)).await {
                warn!("create_event: could not roll back {key}: {undo}; repair will");
            }
            return Err(e);
        }

        if let Err(e) = self.settle(&doc.event_id, &PendingOp::Create, None).await {
            warn!("create_event: event {} linked but marker kept: {e}", doc.event_id);
        }
        Ok(())
    }

    // ── Move ─────────────────────────────────────────────────────

    pub async fn relocate_event(
        &self,
        event_id: &str,
        location_id: &str,
        room_id: &str,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let started = Instant::now();
        let target = Target::Room { location_id, room_id };
        let result = self.move_event("relocate_event", event_id, target, deadline).await;
        finish("relocate_event", started, result)
    }

    /// Change an event's window, keeping its room.
    pub async fn reschedule_event(
        &self,
        event_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let started = Instant::now();
        let result = match validate_window(start, end) {
            Ok(_) => {
                let target = Target::Window { start, end };
                self.move_event("reschedule_event", event_id, target, deadline).await
            }
            Err(e) => Err(e),
        };
        finish("reschedule_event", started, result)
    }

    async fn move_event(
        &self,
        op: &'static str,
        event_id: &str,
        target: Target<'_>,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let current = self.load_event(event_id).await?;
        let from = current.doc.placement();
        let to = target.apply(&from);
        if to == from {
            return Ok(current.doc);
        }
        let _gates = self
            .lock_locations(op, &[from.location_id.as_str(), to.location_id.as_str()], deadline)
            .await?;

        let (from, moved) = if self.store.supports_transactions() {
            with_retry(op, &self.config.retry, deadline, |_| {
                self.try_move_tx(event_id, target)
            })
            .await?
        } else {
            self.move_two_phase(op, event_id, target, deadline).await?
        };

        let to = moved.placement();
        if from != to {
            self.index.remove(&from.location_id, &from.room_id, event_id);
            self.index.add(&to.location_id, &to.room_id, event_id);
            if !from.same_room(&to) {
                self.notify.send(
                    &from.location_id,
                    PlacementChange::EventRemoved {
                        event_id: event_id.to_string(),
                        room_id: from.room_id.clone(),
                    },
                );
            }
            self.notify.send(
                &to.location_id,
                PlacementChange::EventPlaced {
                    event_id: event_id.to_string(),
                    room_id: to.room_id.clone(),
                },
            );
            info!(
                "{op}: event {event_id} now in {}/{} [{} .. {})",
                to.location_id, to.room_id, to.start_date, to.end_date
            );
        }
        Ok(moved)
    }

    async fn try_move_tx(
        &self,
        event_id: &str,
        target: Target<'_>,
    ) -> Result<(Placement, EventDoc), EngineError> {
        let ev = self.load_event(event_id).await?;
        if ev.doc.pending.is_some() {
            return Err(EngineError::conflict(DocKey::event(event_id)));
        }
        let from = ev.doc.placement();
        let to = target.apply(&from);
        if to == from {
            return Ok((from, ev.doc));
        }
        let dst = self.load_location(&to.location_id).await?;
        self.validate_in_room(&dst.doc, &to.room_id, event_id, to.span(), ev.doc.max_tick)
            .await?;

        let mut moved = ev.doc.clone();
        moved.set_placement(to.clone());
        let mut ops = vec![WriteOp::Put {
            doc: Doc::Event(moved.clone()),
            expect: Expect::Version(ev.version),
        }];

        if from.location_id != to.location_id {
            match self.load_location(&from.location_id).await {
                Ok(src) => {
                    let mut unlinked = src.doc;
                    unlinked.unlink_event(event_id);
                    ops.push(WriteOp::Put {
                        doc: Doc::Location(unlinked),
                        expect: Expect::Version(src.version),
                    });
                }
                // Source already gone: nothing to unlink.
                Err(EngineError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        let mut linked = dst.doc;
        linked.unlink_event(event_id);
        linked.link_event(&to.room_id, event_id);
        ops.push(WriteOp::Put {
            doc: Doc::Location(linked),
            expect: Expect::Version(dst.version),
        });

        self.store.transaction(ops).await?;
        Ok((from, moved))
    }

    async fn move_two_phase(
        &self,
        op: &'static str,
        event_id: &str,
        target: Target<'_>,
        deadline: Deadline,
    ) -> Result<(Placement, EventDoc), EngineError> {
        let marked = with_retry(op, &self.config.retry, deadline, |_| {
            self.try_mark_move(event_id, target)
        })
        .await?;
        let (ev, from, to) = match marked {
            Some(m) => m,
            None => {
                let ev = self.load_event(event_id).await?;
                return Ok((ev.doc.placement(), ev.doc));
            }
        };
        let pending = PendingOp::Move { to: to.clone() };

        let linked = with_retry(op, &self.config.retry, deadline, |_| {
            self.try_link(event_id, &to, ev.max_tick)
        })
        .await;
        if let Err(e) = linked {
            // Destination never changed; dropping the marker restores the original placement.
            if let Err(undo) = self.settle(event_id, &pending, None).await {
                warn!("{op}: could not clear marker on {event_id}: {undo}; repair will");
            }
            return Err(e);
        }

        // Completion runs to the end regardless of the caller's deadline.
        if from.location_id != to.location_id
            && let Err(e) = with_retry(op, &self.config.retry, Deadline::none(), |_| {
                self.try_unlink(event_id, &from.location_id)
            })
            .await
        {
            warn!("{op}: stale link to {event_id} left in {}: {e}", from.location_id);
        }

        let moved = match self.settle(event_id, &pending, Some(&to)).await {
            Ok(doc) => doc,
            Err(e) => {
                warn!("{op}: event {event_id} linked at destination but marker kept: {e}");
                let mut doc = ev;
                doc.set_placement(to.clone());
                doc
            }
        };
        Ok((from, moved))
    }

    /// Validate the destination, then stamp the event with a `Move` marker.
    /// `None` when the move turns out to be a no-op.
    async fn try_mark_move(
        &self,
        event_id: &str,
        target: Target<'_>,
    ) -> Result<Option<(EventDoc, Placement, Placement)>, EngineError> {
        let ev = self.load_event(event_id).await?;
        if ev.doc.pending.is_some() {
            return Err(EngineError::conflict(DocKey::event(event_id)));
        }
        let from = ev.doc.placement();
        let to = target.apply(&from);
        if to == from {
            return Ok(None);
        }
        let dst = self.load_location(&to.location_id).await?;
        self.validate_in_room(&dst.doc, &to.room_id, event_id, to.span(), ev.doc.max_tick)
            .await?;

        let marker = Pending { op: PendingOp::Move { to: to.clone() }, since: now_ms() };
        let updated = self.mark(event_id, ev.version, marker).await?;
        Ok(Some((updated, from, to)))
    }

    // ── Delete ───────────────────────────────────────────────────

    pub async fn delete_event(&self, event_id: &str, deadline: Deadline) -> Result<(), EngineError> {
        let started = Instant::now();
        let result = self.delete_event_inner(event_id, deadline).await;
        finish("delete_event", started, result)
    }

    async fn delete_event_inner(&self, event_id: &str, deadline: Deadline) -> Result<(), EngineError> {
        let current = self.load_event(event_id).await?;
        let _gates = self
            .lock_locations("delete_event", &[current.doc.location_id.as_str()], deadline)
            .await?;

        let removed = if self.store.supports_transactions() {
            with_retry("delete_event", &self.config.retry, deadline, |_| {
                self.try_delete_tx(event_id)
            })
            .await?
        } else {
            self.delete_two_phase(event_id, deadline).await?
        };

        self.index.remove(&removed.location_id, &removed.room_id, event_id);
        self.notify.send(
            &removed.location_id,
            PlacementChange::EventRemoved {
                event_id: event_id.to_string(),
                room_id: removed.room_id.clone(),
            },
        );
        info!("event {event_id} deleted from {}/{}", removed.location_id, removed.room_id);
        Ok(())
    }

    async fn try_delete_tx(&self, event_id: &str) -> Result<EventDoc, EngineError> {
        let ev = self.load_event(event_id).await?;
        if ev.doc.pending.is_some() {
            return Err(EngineError::conflict(DocKey::event(event_id)));
        }
        let mut ops = vec![WriteOp::Delete {
            key: DocKey::event(event_id),
            expect: Expect::Version(ev.version),
        }];
        match self.load_location(&ev.doc.location_id).await {
            Ok(loc) => {
                let mut unlinked = loc.doc;
                unlinked.unlink_event(event_id);
                ops.push(WriteOp::Put {
                    doc: Doc::Location(unlinked),
                    expect: Expect::Version(loc.version),
                });
            }
            Err(EngineError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.store.transaction(ops).await?;
        Ok(ev.doc)
    }

    async fn delete_two_phase(&self, event_id: &str, deadline: Deadline) -> Result<EventDoc, EngineError> {
        let marked = with_retry("delete_event", &self.config.retry, deadline, |_| async move {
            let ev = self.load_event(event_id).await?;
            match &ev.doc.pending {
                Some(Pending { op: PendingOp::Delete, .. }) => Ok(ev.doc),
                Some(_) => Err(EngineError::conflict(DocKey::event(event_id))),
                None => {
                    let marker = Pending { op: PendingOp::Delete, since: now_ms() };
                    self.mark(event_id, ev.version, marker).await
                }
            }
        })
        .await?;

        // Past this point the event is hidden; finish regardless of the deadline.
        with_retry("delete_event", &self.config.retry, Deadline::none(), |_| {
            self.try_unlink(event_id, &marked.location_id)
        })
        .await?;
        match self.store.delete(&DocKey::event(event_id), Expect::Any).await {
            Ok(()) | Err(StoreError::NotFound(_)) => Ok(marked),
            Err(e) => Err(e.into()),
        }
    }

    // ── Shared steps ─────────────────────────────────────────────

    /// Re-check placement rules for `event_id` at `room_id` against the room's current occupants.
    pub(super) async fn validate_in_room(
        &self,
        location: &LocationDoc,
        room_id: &str,
        event_id: &str,
        span: Span,
        demand: u32,
    ) -> Result<(), EngineError> {
        let room = placement::room_of(location, room_id)?;
        let occupants = self.occupants(location, room_id, event_id).await?;
        check_placement(
            self.config.policy,
            &location.location_id,
            room,
            span,
            demand,
            &occupants,
        )
    }

    /// Link `event_id` at `to`, dropping any other link it has in that location.
    async fn try_link(&self, event_id: &str, to: &Placement, demand: u32) -> Result<(), EngineError> {
        let loc = self.load_location(&to.location_id).await?;
        self.validate_in_room(&loc.doc, &to.room_id, event_id, to.span(), demand)
            .await?;
        let mut linked = loc.doc;
        linked.unlink_event(event_id);
        linked.link_event(&to.room_id, event_id);
        self.store
            .put(Doc::Location(linked), Expect::Version(loc.version))
            .await?;
        Ok(())
    }

    /// Drop every link to `event_id` from a location. Missing location or link is fine.
    pub(super) async fn try_unlink(&self, event_id: &str, location_id: &str) -> Result<(), EngineError> {
        let loc = match self.load_location(location_id).await {
            Ok(loc) => loc,
            Err(EngineError::NotFound(_)) => return Ok(()),
            Err(e) => return Err(e),
        };
        let mut unlinked = loc.doc.clone();
        unlinked.unlink_event(event_id);
        if unlinked == loc.doc {
            return Ok(());
        }
        self.store
            .put(Doc::Location(unlinked), Expect::Version(loc.version))
            .await?;
        Ok(())
    }

    /// Stamp a pending marker, provided the event is still at `version`.
    async fn mark(
        &self,
        event_id: &str,
        version: Version,
        marker: Pending,
    ) -> Result<EventDoc, EngineError> {
        let key = DocKey::event(event_id);
        let unchanged = |v: &Versioned<Doc>| v.version == version;
        let stamp = |d: &mut Doc| {
            if let Doc::Event(e) = d {
                e.pending = Some(marker.clone());
            }
        };
        match self.store.conditional_update(&key, &unchanged, &stamp).await {
            Ok(Versioned { doc: Doc::Event(e), .. }) => Ok(e),
            Ok(_) | Err(StoreError::NotFound(_)) => {
                Err(EngineError::NotFound(EntityRef::Event(event_id.to_string())))
            }
            Err(StoreError::PreconditionFailed(k)) => Err(EngineError::conflict(k)),
            Err(e) => Err(e.into()),
        }
    }

    /// Clear a marker equal to `expected`, optionally applying its destination.
    pub(super) async fn settle(
        &self,
        event_id: &str,
        expected: &PendingOp,
        placement: Option<&Placement>,
    ) -> Result<EventDoc, EngineError> {
        let key = DocKey::event(event_id);
        let still_pending = |v: &Versioned<Doc>| {
            matches!(&v.doc, Doc::Event(e) if e.pending.as_ref().is_some_and(|p| &p.op == expected))
        };
        let clear = |d: &mut Doc| {
            if let Doc::Event(e) = d {
                if let Some(p) = placement {
                    e.set_placement(p.clone());
                }
                e.pending = None;
            }
        };
        let (key, still_pending, clear) = (&key, &still_pending, &clear);
        with_retry("settle", &self.config.retry, Deadline::none(), |_| async move {
            match self.store.conditional_update(key, still_pending, clear).await {
                Ok(Versioned { doc: Doc::Event(e), .. }) => Ok(e),
                Ok(_) | Err(StoreError::NotFound(_)) => {
                    Err(EngineError::NotFound(EntityRef::Event(event_id.to_string())))
                }
                Err(StoreError::PreconditionFailed(_)) => Err(EngineError::InvalidArgument(
                    format!("event {event_id} no longer carries the expected marker"),
                )),
                Err(e) => Err(e.into()),
            }
        })
        .await
    }
}
