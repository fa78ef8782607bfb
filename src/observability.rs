use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: engine operations executed. Labels: op, status.
pub const OPERATIONS_TOTAL: &str = "evecs_operations_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OPERATION_DURATION_SECONDS: &str = "evecs_operation_duration_seconds";

/// Counter: optimistic-concurrency conflicts absorbed by a retry. Labels: op.
pub const CONFLICT_RETRIES_TOTAL: &str = "evecs_conflict_retries_total";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: tickets handed out by `reserve`.
pub const TICKETS_RESERVED_TOTAL: &str = "evecs_tickets_reserved_total";

/// Counter: tickets given back by `release`.
pub const TICKETS_RELEASED_TOTAL: &str = "evecs_tickets_released_total";

/// Counter: reconciliation passes run.
pub const REPAIRS_TOTAL: &str = "evecs_repairs_total";

/// Counter: back-references added or removed by reconciliation.
pub const REFERENCES_FIXED_TOTAL: &str = "evecs_references_fixed_total";

/// Counter: pending markers rolled forward or back.
pub const PENDING_RESOLVED_TOTAL: &str = "evecs_pending_resolved_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "evecs_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "evecs_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Record the outcome and latency of one engine operation.
pub fn record_operation(op: &'static str, status: &'static str, started: std::time::Instant) {
    metrics::counter!(OPERATIONS_TOTAL, "op" => op, "status" => status).increment(1);
    metrics::histogram!(OPERATION_DURATION_SECONDS, "op" => op)
        .record(started.elapsed().as_secs_f64());
}
