use std::net::SocketAddr;

use crate::sql::{AppointmentFilter, Command};

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "appointd_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "appointd_query_duration_seconds";

/// Counter: bookings and moves refused because the window was taken.
pub const BOOKING_CONFLICTS_TOTAL: &str = "appointd_booking_conflicts_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "appointd_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "appointd_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "appointd_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "appointd_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "appointd_wal_flush_batch_size";

/// Counter: WAL compactions completed.
pub const WAL_COMPACTIONS_TOTAL: &str = "appointd_wal_compactions_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
/// A failed install is logged; the server runs on without metrics.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::warn!("metrics exporter not installed: {e}"),
    }
}

/// Map a Command variant to a short label for metrics.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertPatient(_) => "insert_patient",
        Command::InsertDoctor(_) => "insert_doctor",
        Command::InsertAppointment { .. } => "insert_appointment",
        Command::UpdateAppointment { .. } => "update_appointment",
        Command::CancelAppointment { .. } => "cancel_appointment",
        Command::CompleteAppointment { .. } => "complete_appointment",
        Command::DeleteAppointment { .. } => "delete_appointment",
        Command::SelectAppointments(AppointmentFilter::Overlapping { .. }) => "select_conflicts",
        Command::SelectAppointments(_) => "select_appointments",
        Command::SelectPatients { .. } => "select_patients",
        Command::SelectDoctors { .. } => "select_doctors",
    }
}
