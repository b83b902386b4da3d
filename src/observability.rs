use std::net::SocketAddr;

use crate::command::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total requests handled. Labels: command, status.
pub const REQUESTS_TOTAL: &str = "labslot_requests_total";

/// Histogram: request latency in seconds. Labels: command.
pub const REQUEST_DURATION_SECONDS: &str = "labslot_request_duration_seconds";

// ── Domain metrics ──────────────────────────────────────────────

/// Counter: booking status transitions. Labels: to.
pub const BOOKING_TRANSITIONS_TOTAL: &str = "labslot_booking_transitions_total";

/// Counter: maintenance ticket transitions. Labels: to.
pub const TICKET_TRANSITIONS_TOTAL: &str = "labslot_ticket_transitions_total";

/// Counter: notifications stored. Labels: kind.
pub const NOTIFICATIONS_TOTAL: &str = "labslot_notifications_total";

/// Counter: notifications dropped after a failed write.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "labslot_notifications_failed_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "labslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "labslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "labslot_connections_rejected_total";

/// Counter: requests whose credential did not resolve.
pub const AUTH_FAILURES_TOTAL: &str = "labslot_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "labslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "labslot_wal_flush_batch_size";

/// Counter: completed WAL compactions.
pub const WAL_COMPACTIONS_TOTAL: &str = "labslot_wal_compactions_total";

/// Install the Prometheus exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), metrics_exporter_prometheus::BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

/// Short metric label for a command.
pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::Register { .. } => "register",
        Command::Login { .. } => "login",
        Command::Me => "me",
        Command::UpdateMe { .. } => "update_me",
        Command::Users => "users",
        Command::Labs => "labs",
        Command::Equipment { .. } => "equipment",
        Command::LabSchedule { .. } => "lab_schedule",
        Command::LabBookings { .. } => "lab_bookings",
        Command::MyBookings => "my_bookings",
        Command::PendingBookings => "pending_bookings",
        Command::Booking { .. } => "booking",
        Command::CreateBooking { .. } => "create_booking",
        Command::ApproveBooking { .. } => "approve_booking",
        Command::RejectBooking { .. } => "reject_booking",
        Command::CancelBooking { .. } => "cancel_booking",
        Command::RequestEquipment { .. } => "request_equipment",
        Command::EquipmentRequests => "equipment_requests",
        Command::MaintenanceTickets => "maintenance_tickets",
        Command::MaintenanceTicket { .. } => "maintenance_ticket",
        Command::ReportIssue { .. } => "report_issue",
        Command::AssignTicket { .. } => "assign_ticket",
        Command::ResolveTicket { .. } => "resolve_ticket",
        Command::Experiments => "experiments",
        Command::CreateExperiment { .. } => "create_experiment",
        Command::UploadDocument { .. } => "upload_document",
        Command::MyNotifications => "my_notifications",
        Command::UnreadCount => "unread_count",
        Command::MarkNotificationRead { .. } => "mark_notification_read",
    }
}
