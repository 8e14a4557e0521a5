use std::net::SocketAddr;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "pitstop_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "pitstop_query_duration_seconds";

// ── Booking metrics ─────────────────────────────────────────────

/// Histogram: slots returned per availability query.
pub const SLOTS_RETURNED: &str = "pitstop_slots_returned";

/// Counter: reservations successfully created.
pub const RESERVATIONS_CREATED_TOTAL: &str = "pitstop_reservations_created_total";

/// Counter: reservation requests rejected. Labels: kind.
pub const RESERVATION_REJECTIONS_TOTAL: &str = "pitstop_reservation_rejections_total";

/// Counter: reservations that got the fallback recommendation text.
pub const RECOMMENDATION_FALLBACKS_TOTAL: &str = "pitstop_recommendation_fallbacks_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "pitstop_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "pitstop_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "pitstop_connections_rejected_total";

/// Counter: startup/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "pitstop_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "pitstop_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "pitstop_wal_flush_batch_size";

/// Install the Prometheus exporter on the given port. No-op if port is None.
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

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::SelectAvailableSlots(_) => "select_available_slots",
        Command::SelectServices => "select_services",
        Command::SelectReservations => "select_reservations",
        Command::SelectVehicles => "select_vehicles",
        Command::InsertReservation(_) => "insert_reservation",
        Command::CancelReservation { .. } => "cancel_reservation",
        Command::UpdateReservationStatus { .. } => "update_reservation_status",
        Command::InsertVehicle(_) => "insert_vehicle",
        Command::InsertService(_) => "insert_service",
        Command::InsertEmployee(_) => "insert_employee",
        Command::InsertSchedule { .. } => "insert_schedule",
        Command::DeleteSchedule { .. } => "delete_schedule",
    }
}
