use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total statements executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "rental_queries_total";

/// Histogram: statement latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "rental_query_duration_seconds";

// ── Booking / hold domain metrics ───────────────────────────────

/// Counter: create_booking outcomes. Labels: outcome
/// (committed, replayed, conflict, bad_request, transient, error).
pub const BOOKINGS_TOTAL: &str = "rental_bookings_total";

/// Histogram: serializable commit attempts per create_booking call.
pub const BOOKING_COMMIT_ATTEMPTS: &str = "rental_booking_commit_attempts";

/// Counter: commits rejected by read-set validation.
pub const SERIALIZATION_FAILURES_TOTAL: &str = "rental_serialization_failures_total";

/// Counter: bookings cancelled.
pub const BOOKINGS_CANCELLED_TOTAL: &str = "rental_bookings_cancelled_total";

/// Counter: create_hold outcomes. Labels: outcome (placed, conflict, rejected).
pub const HOLDS_TOTAL: &str = "rental_holds_total";

/// Counter: holds deleted. Labels: reason (released, consumed, swept).
pub const HOLDS_REMOVED_TOTAL: &str = "rental_holds_removed_total";

/// Counter: downstream notification failures. Labels: sink.
pub const NOTIFY_FAILURES_TOTAL: &str = "rental_notify_failures_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "rental_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "rental_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "rental_connections_rejected_total";

/// Counter: connections whose database name is not a valid tenant context.
pub const AUTH_FAILURES_TOTAL: &str = "rental_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "rental_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "rental_wal_flush_batch_size";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertItems { .. } => "insert_items",
        Command::InsertHold { .. } => "insert_hold",
        Command::DeleteHold { .. } => "delete_hold",
        Command::SelectHold { .. } => "select_hold",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectAvailability { .. } => "select_availability",
    }
}
