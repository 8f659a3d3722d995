use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total operations executed. Labels: op, status.
pub const OPS_TOTAL: &str = "kairos_ops_total";

/// Histogram: operation latency in seconds. Labels: op.
pub const OP_DURATION_SECONDS: &str = "kairos_op_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "kairos_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "kairos_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "kairos_connections_rejected_total";

/// Counter: handshake/auth failures.
pub const AUTH_FAILURES_TOTAL: &str = "kairos_auth_failures_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "kairos_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "kairos_wal_flush_batch_size";

/// Counter: calendar sync calls that failed soft.
pub const CALENDAR_SYNC_FAILURES_TOTAL: &str = "kairos_calendar_sync_failures_total";

/// Counter: payments settled.
pub const PAYMENTS_SETTLED_TOTAL: &str = "kairos_payments_settled_total";

/// Install Prometheus metrics exporter on the given port. No-op if port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}

/// Map a Request variant to a short label for metrics.
pub fn op_label(req: &Request) -> &'static str {
    match req {
        Request::RegisterUser { .. } => "register_user",
        Request::PublishService { .. } => "publish_service",
        Request::UpdateService { .. } => "update_service",
        Request::ListServices => "list_services",
        Request::Slots { .. } => "slots",
        Request::Book { .. } => "book",
        Request::Reschedule { .. } => "reschedule",
        Request::SetMeetingDetails { .. } => "set_meeting_details",
        Request::Confirm { .. } => "confirm",
        Request::Cancel { .. } => "cancel",
        Request::Session { .. } => "session",
        Request::Sessions { .. } => "sessions",
        Request::SettlePayment { .. } => "settle_payment",
        Request::Payment { .. } => "payment",
        Request::LeaveReview { .. } => "leave_review",
        Request::Review { .. } => "review",
        Request::Subscribe { .. } => "subscribe",
    }
}
