use std::time::Instant;

use tracing::{debug, info, warn};

use crate::limits::MAX_TICKETS_PER_CALL;
use crate::model::*;
use crate::observability;
use crate::store::{Doc, DocKey, Expect, StoreError, Versioned, WriteOp};

use super::placement::now_ms;
use super::retry::with_retry;
use super::{finish, Deadline, Engine, EngineError, EntityRef};

#[derive(Debug, Clone, Copy)]
enum Adjust {
    Reserve(u32),
    Release(u32),
}

impl Adjust {
    fn permits(&self, e: &EventDoc) -> bool {
        if e.is_pending_delete() {
            return false;
        }
        match *self {
            Adjust::Reserve(n) => e
                .tickets_reserved
                .checked_add(n)
                .is_some_and(|total| total <= e.ticket_ceiling()),
            Adjust::Release(n) => e.tickets_reserved >= n,
        }
    }

    fn apply(&self, e: &mut EventDoc) {
        match *self {
            Adjust::Reserve(n) => e.tickets_reserved += n,
            Adjust::Release(n) => e.tickets_reserved -= n,
        }
    }
}

fn check_count(n: u32) -> Result<(), EngineError> {
    if n == 0 {
        return Err(EngineError::InvalidArgument("ticket count must be positive".into()));
    }
    if n > MAX_TICKETS_PER_CALL {
        return Err(EngineError::LimitExceeded("too many tickets in one call"));
    }
    Ok(())
}

impl Engine {
    /// Take `n` tickets. Returns the new `tickets_reserved`.
    ///
    /// The bound is checked and the counter bumped in one conditional write,
    /// so of several racing calls exactly those that fit succeed.
    pub async fn reserve(
        &self,
        event_id: &str,
        n: u32,
        deadline: Deadline,
    ) -> Result<u32, EngineError> {
        let started = Instant::now();
        let result = self.adjust("reserve", event_id, Adjust::Reserve(n), deadline).await;
        if result.is_ok() {
            metrics::counter!(observability::TICKETS_RESERVED_TOTAL).increment(n as u64);
        }
        finish("reserve", started, result)
    }

    /// Give back `n` tickets. Releasing more than is reserved is a caller bug.
    pub async fn release(
        &self,
        event_id: &str,
        n: u32,
        deadline: Deadline,
    ) -> Result<u32, EngineError> {
        let started = Instant::now();
        let result = self.adjust("release", event_id, Adjust::Release(n), deadline).await;
        if result.is_ok() {
            metrics::counter!(observability::TICKETS_RELEASED_TOTAL).increment(n as u64);
        }
        finish("release", started, result)
    }

    async fn adjust(
        &self,
        op: &'static str,
        event_id: &str,
        adjust: Adjust,
        deadline: Deadline,
    ) -> Result<u32, EngineError> {
        let (Adjust::Reserve(n) | Adjust::Release(n)) = adjust;
        check_count(n)?;

        let updated = with_retry(op, &self.config.retry, deadline, |_| {
            self.try_adjust(event_id, adjust)
        })
        .await?;

        debug!("{op}: event {event_id} now at {}/{}", updated.tickets_reserved, updated.max_tick);
        self.notify.send(
            &updated.location_id,
            PlacementChange::TicketsChanged {
                event_id: event_id.to_string(),
                tickets_reserved: updated.tickets_reserved,
            },
        );
        Ok(updated.tickets_reserved)
    }

    async fn try_adjust(&self, event_id: &str, adjust: Adjust) -> Result<EventDoc, EngineError> {
        let key = DocKey::event(event_id);
        let permits = |v: &Versioned<Doc>| matches!(&v.doc, Doc::Event(e) if adjust.permits(e));
        let apply = |d: &mut Doc| {
            if let Doc::Event(e) = d {
                adjust.apply(e);
            }
        };
        match self.store.conditional_update(&key, &permits, &apply).await {
            Ok(Versioned { doc: Doc::Event(e), .. }) => Ok(e),
            Ok(_) | Err(StoreError::NotFound(_)) => {
                Err(EngineError::NotFound(EntityRef::Event(event_id.to_string())))
            }
            Err(StoreError::PreconditionFailed(_)) => Err(self.refusal(event_id, adjust).await),
            Err(e) => Err(e.into()),
        }
    }

    /// Why a conditional ticket write was refused, judged on a fresh read.
    async fn refusal(&self, event_id: &str, adjust: Adjust) -> EngineError {
        let ev = match self.load_event(event_id).await {
            Ok(ev) => ev.doc,
            Err(e) => return e,
        };
        if ev.is_pending_delete() {
            return EngineError::NotFound(EntityRef::Event(event_id.to_string()));
        }
        if adjust.permits(&ev) {
            // Counter moved between the write and the read; try again.
            return EngineError::conflict(DocKey::event(event_id));
        }
        match adjust {
            Adjust::Reserve(n) => EngineError::CapacityExceeded {
                event_id: event_id.to_string(),
                requested: n,
                available: ev.remaining_tickets(),
            },
            Adjust::Release(n) => EngineError::InvalidArgument(format!(
                "cannot release {n} tickets from event {event_id}: only {} reserved",
                ev.tickets_reserved
            )),
        }
    }

    /// Raise an event's `max_tick`. Only one of its creators may do this.
    ///
    /// Under the shared policy the larger ceiling counts against the room, so
    /// the placement is re-checked and the location's version bumped to make
    /// concurrent placements re-validate.
    pub async fn raise_ticket_ceiling(
        &self,
        event_id: &str,
        actor_user_id: &str,
        new_max_tick: u32,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let started = Instant::now();
        let result = self
            .raise_ceiling_inner(event_id, actor_user_id, new_max_tick, deadline)
            .await;
        finish("raise_ticket_ceiling", started, result)
    }

    async fn raise_ceiling_inner(
        &self,
        event_id: &str,
        actor: &str,
        new_max: u32,
        deadline: Deadline,
    ) -> Result<EventDoc, EngineError> {
        let current = self.load_event(event_id).await?;
        let _gates = self
            .lock_locations("raise_ticket_ceiling", &[current.doc.location_id.as_str()], deadline)
            .await?;

        let raised = with_retry("raise_ticket_ceiling", &self.config.retry, deadline, |_| {
            self.try_raise(event_id, actor, new_max)
        })
        .await?;
        info!("event {event_id}: max_tick raised to {new_max} by {actor}");
        Ok(raised)
    }

    async fn try_raise(&self, event_id: &str, actor: &str, new_max: u32) -> Result<EventDoc, EngineError> {
        let ev = self.load_event(event_id).await?;
        if !ev.doc.creator_id.iter().any(|c| c == actor) {
            return Err(EngineError::InvalidArgument(format!(
                "user {actor} is not a creator of event {event_id}"
            )));
        }
        if new_max < ev.doc.max_tick {
            return Err(EngineError::InvalidArgument(format!(
                "max_tick can only be raised ({} -> {new_max})",
                ev.doc.max_tick
            )));
        }
        if new_max == ev.doc.max_tick {
            return Ok(ev.doc);
        }
        if ev.doc.pending.is_some() {
            return Err(EngineError::conflict(DocKey::event(event_id)));
        }

        let mut raised = ev.doc.clone();
        raised.max_tick = new_max;

        if self.config.policy == BookingPolicy::Exclusive {
            self.store
                .put(Doc::Event(raised.clone()), Expect::Version(ev.version))
                .await?;
            return Ok(raised);
        }

        let loc = self.load_location(&ev.doc.location_id).await?;
        self.validate_in_room(&loc.doc, &ev.doc.room_id, event_id, ev.doc.span(), new_max)
            .await?;

        if self.store.supports_transactions() {
            // Rewriting the location unchanged bumps its version.
            self.store
                .transaction(vec![
                    WriteOp::Put { doc: Doc::Event(raised.clone()), expect: Expect::Version(ev.version) },
                    WriteOp::Put { doc: Doc::Location(loc.doc), expect: Expect::Version(loc.version) },
                ])
                .await?;
            return Ok(raised);
        }

        // Mark the raise on the event, then touch the location. A placement
        // that read the location before the touch fails its own versioned
        // write and re-reads our new ceiling. Reserves stay under the old
        // ceiling while the marker is set, so undoing the raise always fits.
        let old_max = ev.doc.max_tick;
        let mut marked = raised;
        marked.pending = Some(Pending { op: PendingOp::Raise { from: old_max }, since: now_ms() });
        self.store
            .put(Doc::Event(marked), Expect::Version(ev.version))
            .await?;

        let key = DocKey::event(event_id);
        let ours = |v: &Versioned<Doc>| {
            matches!(
                &v.doc,
                Doc::Event(e) if matches!(e.pending, Some(Pending { op: PendingOp::Raise { .. }, .. }))
            )
        };
        let touched = self
            .store
            .put(Doc::Location(loc.doc), Expect::Version(loc.version))
            .await;
        match touched {
            Ok(_) => {
                let clear = |d: &mut Doc| {
                    if let Doc::Event(e) = d {
                        e.pending = None;
                    }
                };
                match self.store.conditional_update(&key, &ours, &clear).await {
                    Ok(Versioned { doc: Doc::Event(e), .. }) => Ok(e),
                    Ok(_) | Err(StoreError::NotFound(_)) => {
                        Err(EngineError::NotFound(EntityRef::Event(event_id.to_string())))
                    }
                    // Repair rolled the marker back first.
                    Err(StoreError::PreconditionFailed(_)) => Err(EngineError::conflict(key)),
                    Err(e) => Err(e.into()),
                }
            }
            Err(StoreError::Conflict(k)) => {
                // Someone placed an event meanwhile; undo and re-validate.
                let revert = |d: &mut Doc| {
                    if let Doc::Event(e) = d {
                        e.max_tick = old_max;
                        e.pending = None;
                    }
                };
                match self.store.conditional_update(&key, &ours, &revert).await {
                    Ok(_) | Err(StoreError::PreconditionFailed(_)) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => {
                        warn!("raise_ticket_ceiling: revert of {event_id} failed: {e}; repair will");
                        return Err(e.into());
                    }
                }
                Err(EngineError::conflict(k))
            }
            // The marker stays; repair rolls it back.
            Err(e) => Err(e.into()),
        }
    }
}
