use std::net::SocketAddr;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: wire requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "bayline_requests_total";

/// Histogram: wire request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "bayline_request_duration_seconds";

/// Counter: availability queries computed.
pub const SLOT_QUERIES_TOTAL: &str = "bayline_slot_queries_total";

// ── Reservation lifecycle ───────────────────────────────────────

pub const HOLDS_PLACED_TOTAL: &str = "bayline_holds_placed_total";
pub const HOLDS_EXPIRED_TOTAL: &str = "bayline_holds_expired_total";
pub const HOLD_CONFLICTS_TOTAL: &str = "bayline_hold_conflicts_total";
pub const BOOKINGS_CONFIRMED_TOTAL: &str = "bayline_bookings_confirmed_total";

/// Gauge: holds currently live.
pub const HOLDS_ACTIVE: &str = "bayline_holds_active";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "bayline_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "bayline_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "bayline_connections_rejected_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "bayline_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "bayline_wal_flush_batch_size";

/// Install the Prometheus metrics exporter on the given port. No-op if
/// port is None.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .expect("failed to install Prometheus metrics exporter");
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
}
