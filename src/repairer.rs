use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::engine::{Deadline, Engine};
use crate::model::{EventDoc, PendingOp};
use crate::store::LocalStore;

/// Locations touched by an event stuck in a two-phase operation.
fn touched_locations(events: &[EventDoc]) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for ev in events {
        out.insert(ev.location_id.clone());
        if let Some(p) = &ev.pending
            && let PendingOp::Move { to } = &p.op
        {
            out.insert(to.location_id.clone());
        }
    }
    out
}

/// Background task that reconciles locations holding stale pending markers.
pub async fn run_repairer(engine: Arc<Engine>, every: Duration, stale_after: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let stale = match engine.stale_pending(stale_after).await {
            Ok(stale) => stale,
            Err(e) => {
                warn!("repairer: scan failed: {e}");
                continue;
            }
        };
        if stale.is_empty() {
            continue;
        }
        for location_id in touched_locations(&stale) {
            match engine
                .repair_references(&location_id, Deadline::within(every))
                .await
            {
                Ok(report) if report.is_clean() => {}
                Ok(report) => info!(
                    "repairer: {location_id} resolved {} pending, fixed {} refs",
                    report.pending_resolved,
                    report.added + report.removed
                ),
                // Location may be gone; repair_all reports those orphans.
                Err(e) => debug!("repairer skip {location_id}: {e}"),
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends pile up.
pub async fn run_compactor(store: Arc<LocalStore>, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    loop {
        interval.tick().await;
        let appends = store.appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match store.compact().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => warn!("compaction failed: {e}"),
        }
    }
}
