use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::model::*;
use crate::observability;
use crate::store::{Collection, Doc, DocKey, Expect, StoreError, Versioned};

use super::placement::now_ms;
use super::retry::with_retry;
use super::{finish, Deadline, Engine, EngineError};

/// Outcome of one reconciliation pass over a location.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub location_id: String,
    /// Back-references written because an event pointed here without one.
    pub added: usize,
    /// Back-references dropped because no matching event exists.
    pub removed: usize,
    /// Pending markers rolled forward or back.
    pub pending_resolved: usize,
    /// Events pointing at a room (or location) that does not exist.
    pub orphaned: Vec<String>,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.added == 0 && self.removed == 0 && self.pending_resolved == 0 && self.orphaned.is_empty()
    }
}

impl Engine {
    /// Recompute a location's back-references from the event collection.
    ///
    /// Pending markers older than the configured grace are resolved first:
    /// a `Create` or `Move` whose link landed is rolled forward, one whose
    /// link never landed is undone, a `Delete` is always finished and an
    /// unfinished ceiling `Raise` is rolled back.
    pub async fn repair_references(
        &self,
        location_id: &str,
        deadline: Deadline,
    ) -> Result<RepairReport, EngineError> {
        let started = Instant::now();
        let result = self.repair_inner(location_id, deadline).await;
        finish("repair_references", started, result)
    }

    async fn repair_inner(&self, location_id: &str, deadline: Deadline) -> Result<RepairReport, EngineError> {
        let _gates = self
            .lock_locations("repair_references", &[location_id], deadline)
            .await?;
        let resolved = self.resolve_pending_for(location_id).await?;

        let mut report = with_retry("repair_references", &self.config.retry, deadline, |_| {
            self.try_rebuild_references(location_id)
        })
        .await?;
        report.pending_resolved = resolved;

        metrics::counter!(observability::REPAIRS_TOTAL).increment(1);
        let fixed = report.added + report.removed;
        if fixed > 0 {
            metrics::counter!(observability::REFERENCES_FIXED_TOTAL).increment(fixed as u64);
            self.notify.send(
                location_id,
                PlacementChange::ReferencesRepaired { added: report.added, removed: report.removed },
            );
        }
        if !report.is_clean() {
            info!(
                "repaired {location_id}: +{} -{} refs, {} pending resolved, {} orphaned",
                report.added,
                report.removed,
                report.pending_resolved,
                report.orphaned.len()
            );
        }
        Ok(report)
    }

    /// Repair every location, plus a report per missing location that events still point at.
    pub async fn repair_all(&self, deadline: Deadline) -> Result<Vec<RepairReport>, EngineError> {
        let locations = self.store.scan(Collection::Locations).await?;
        let known: BTreeSet<String> = locations.iter().map(|v| v.doc.key().id).collect();

        let mut reports = Vec::with_capacity(known.len());
        for location_id in &known {
            reports.push(self.repair_references(location_id, deadline).await?);
        }

        let mut missing: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for v in self.store.scan(Collection::Events).await? {
            if let Doc::Event(ev) = v.doc
                && !known.contains(&ev.location_id)
            {
                missing.entry(ev.location_id).or_default().push(ev.event_id);
            }
        }
        for (location_id, orphaned) in missing {
            warn!("{} event(s) point at missing location {location_id}", orphaned.len());
            reports.push(RepairReport { location_id, orphaned, ..RepairReport::default() });
        }
        Ok(reports)
    }

    /// Events whose pending marker has been sitting for at least `older_than`.
    pub async fn stale_pending(&self, older_than: Duration) -> Result<Vec<EventDoc>, EngineError> {
        let cutoff = cutoff_before(older_than);
        let mut stale = Vec::new();
        for v in self.store.scan(Collection::Events).await? {
            if let Doc::Event(ev) = v.doc
                && ev.pending.as_ref().is_some_and(|p| p.since <= cutoff)
            {
                stale.push(ev);
            }
        }
        Ok(stale)
    }

    async fn resolve_pending_for(&self, location_id: &str) -> Result<usize, EngineError> {
        let cutoff = cutoff_before(self.config.pending_grace);
        let mut resolved = 0;
        for v in self.store.scan(Collection::Events).await? {
            let Doc::Event(ev) = v.doc else { continue };
            let Some(pending) = &ev.pending else { continue };
            let touches_here = ev.location_id == location_id
                || matches!(&pending.op, PendingOp::Move { to } if to.location_id == location_id);
            if !touches_here || pending.since > cutoff {
                continue;
            }
            let event_id = ev.event_id.clone();
            match self.resolve_pending(Versioned { doc: ev, version: v.version }).await {
                Ok(()) => {
                    resolved += 1;
                    metrics::counter!(observability::PENDING_RESOLVED_TOTAL).increment(1);
                }
                // Someone else touched it first.
                Err(e) if is_contended(&e) => debug!("pending on {event_id} moved on: {e}"),
                Err(e) => return Err(e),
            }
        }
        Ok(resolved)
    }

    async fn resolve_pending(&self, ev: Versioned<EventDoc>) -> Result<(), EngineError> {
        let Some(pending) = ev.doc.pending.clone() else { return Ok(()) };
        let event_id = ev.doc.event_id.as_str();
        let key = DocKey::event(event_id);

        match &pending.op {
            PendingOp::Create => {
                if self.is_linked_at(&ev.doc.location_id, &ev.doc.room_id, event_id).await? {
                    self.settle(event_id, &pending.op, None).await?;
                    debug!("pending create of {event_id} rolled forward");
                } else {
                    self.store.delete(&key, Expect::Version(ev.version)).await?;
                    debug!("pending create of {event_id} rolled back");
                }
            }
            PendingOp::Move { to } => {
                if self.is_linked_at(&to.location_id, &to.room_id, event_id).await? {
                    self.settle(event_id, &pending.op, Some(to)).await?;
                    if to.location_id != ev.doc.location_id {
                        self.try_unlink(event_id, &ev.doc.location_id).await?;
                    }
                    debug!("pending move of {event_id} rolled forward");
                } else {
                    self.settle(event_id, &pending.op, None).await?;
                    debug!("pending move of {event_id} rolled back");
                }
            }
            PendingOp::Delete => {
                self.try_unlink(event_id, &ev.doc.location_id).await?;
                match self.store.delete(&key, Expect::Version(ev.version)).await {
                    Ok(()) | Err(StoreError::NotFound(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                debug!("pending delete of {event_id} finished");
            }
            PendingOp::Raise { from } => {
                // Reserves never passed `from` while the marker was up.
                let from = *from;
                let raising = |v: &Versioned<Doc>| {
                    matches!(
                        &v.doc,
                        Doc::Event(e) if matches!(e.pending, Some(Pending { op: PendingOp::Raise { .. }, .. }))
                    )
                };
                let revert = |d: &mut Doc| {
                    if let Doc::Event(e) = d {
                        e.max_tick = from;
                        e.pending = None;
                    }
                };
                self.store.conditional_update(&key, &raising, &revert).await?;
                debug!("interrupted ceiling raise on {event_id} rolled back to {from}");
            }
        }
        Ok(())
    }

    async fn is_linked_at(&self, location_id: &str, room_id: &str, event_id: &str) -> Result<bool, EngineError> {
        match self.load_location(location_id).await {
            Ok(loc) => Ok(loc.doc.is_linked(room_id, event_id)),
            Err(EngineError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn try_rebuild_references(&self, location_id: &str) -> Result<RepairReport, EngineError> {
        let loc = self.load_location(location_id).await?;

        // event id -> room it must be linked in
        let mut expected: BTreeMap<String, String> = BTreeMap::new();
        // pending events keep whatever links they have until resolved
        let mut in_flight: HashSet<String> = HashSet::new();
        let mut orphaned = Vec::new();

        for v in self.store.scan(Collection::Events).await? {
            let Doc::Event(ev) = v.doc else { continue };
            let moving_here = matches!(
                &ev.pending,
                Some(Pending { op: PendingOp::Move { to }, .. }) if to.location_id == location_id
            );
            if ev.pending.is_some() && (ev.location_id == location_id || moving_here) {
                in_flight.insert(ev.event_id);
                continue;
            }
            if ev.location_id != location_id {
                continue;
            }
            if loc.doc.room(&ev.room_id).is_some() {
                expected.insert(ev.event_id, ev.room_id);
            } else {
                orphaned.push(ev.event_id);
            }
        }

        let mut fixed = loc.doc.clone();
        let mut removed = 0;

        let mut seen = HashSet::new();
        fixed.events_ids.retain(|r| {
            let keep = (expected.contains_key(&r.event_id) || in_flight.contains(&r.event_id))
                && seen.insert(r.event_id.clone());
            if !keep {
                removed += 1;
            }
            keep
        });
        for room in &mut fixed.rooms {
            let room_id = room.room_id.clone();
            let mut seen = HashSet::new();
            room.events_ids.retain(|r| {
                let belongs = expected.get(&r.event_id) == Some(&room_id)
                    || in_flight.contains(&r.event_id);
                let keep = belongs && seen.insert(r.event_id.clone());
                if !keep {
                    removed += 1;
                }
                keep
            });
        }

        let mut added = 0;
        for (event_id, room_id) in &expected {
            if !fixed.is_linked(room_id, event_id) {
                fixed.link_event(room_id, event_id);
                added += 1;
            }
        }

        if fixed != loc.doc {
            self.store
                .put(Doc::Location(fixed.clone()), Expect::Version(loc.version))
                .await?;
        }
        self.index.load_location(&fixed);

        Ok(RepairReport {
            location_id: location_id.to_string(),
            added,
            removed,
            pending_resolved: 0,
            orphaned,
        })
    }
}

/// `now - age` in store milliseconds. Ages past what `Ms` holds saturate, so
/// nothing is old enough.
fn cutoff_before(age: Duration) -> Ms {
    let age = Ms::try_from(age.as_millis()).unwrap_or(Ms::MAX);
    now_ms().saturating_sub(age)
}

fn is_contended(e: &EngineError) -> bool {
    e.is_retryable()
        || matches!(
            e,
            EngineError::InvalidArgument(_)
                | EngineError::NotFound(_)
                | EngineError::Store(StoreError::PreconditionFailed(_))
        )
}
