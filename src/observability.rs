use std::net::SocketAddr;

use crate::sql::Command;

// ── Booking decisions ───────────────────────────────────────────

/// Counter: bookings admitted. Labels: class, state.
pub const ADMISSIONS_TOTAL: &str = "paddock_admissions_total";

/// Counter: admission requests refused. Labels: reason.
pub const REJECTIONS_TOTAL: &str = "paddock_rejections_total";

/// Counter: reconciliation runs. Labels: status.
pub const RECONCILE_RUNS_TOTAL: &str = "paddock_reconcile_runs_total";

/// Counter: pending bookings promoted to confirmed.
pub const RECONCILE_CONFIRMED_TOTAL: &str = "paddock_reconcile_confirmed_total";

/// Histogram: reconciliation run duration in seconds.
pub const RECONCILE_DURATION_SECONDS: &str = "paddock_reconcile_duration_seconds";

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "paddock_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "paddock_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

pub const CONNECTIONS_ACTIVE: &str = "paddock_connections_active";

pub const CONNECTIONS_TOTAL: &str = "paddock_connections_total";

/// Counter: connections turned away at the connection limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "paddock_connections_rejected_total";

/// Gauge: venues with a loaded engine.
pub const VENUES_ACTIVE: &str = "paddock_venues_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "paddock_wal_flush_duration_seconds";

/// Histogram: events per group-commit flush.
pub const WAL_FLUSH_BATCH_SIZE: &str = "paddock_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op without a port.
pub fn init(port: Option<u16>) -> Result<(), String> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("failed to install Prometheus exporter: {e}"))?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metrics label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertArena { .. } => "insert_arena",
        Command::DeleteArena { .. } => "delete_arena",
        Command::SelectArenas => "select_arenas",
        Command::InsertHorse { .. } => "insert_horse",
        Command::DeleteHorse { .. } => "delete_horse",
        Command::InsertStaff { .. } => "insert_staff",
        Command::DeleteStaff { .. } => "delete_staff",
        Command::SetQuotaConfig { .. } => "set_quota_config",
        Command::ClearQuotaConfig => "clear_quota_config",
        Command::SelectQuotaConfig => "select_quota_config",
        Command::InsertBooking(_) => "insert_booking",
        Command::Reschedule { .. } => "reschedule",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::SelectBooking { .. } => "select_booking",
        Command::SelectBookings { .. } => "select_bookings",
        Command::Reconcile { .. } => "reconcile",
    }
}
