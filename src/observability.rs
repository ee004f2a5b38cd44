use std::net::SocketAddr;

use crate::wire::Request;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: requests handled. Labels: op, status.
pub const REQUESTS_TOTAL: &str = "hotelcal_requests_total";

/// Histogram: request latency in seconds. Labels: op.
pub const REQUEST_DURATION_SECONDS: &str = "hotelcal_request_duration_seconds";

// ── Booking outcomes ────────────────────────────────────────────

/// Counter: bookings that reached Confirmed, directly or through a hold.
pub const BOOKINGS_COMMITTED_TOTAL: &str = "hotelcal_bookings_committed_total";

/// Counter: reservations refused because a night was taken.
pub const CONFLICTS_TOTAL: &str = "hotelcal_conflicts_total";

/// Counter: live bookings cancelled.
pub const CANCELLATIONS_TOTAL: &str = "hotelcal_cancellations_total";

/// Counter: holds released by the reaper.
pub const HOLDS_EXPIRED_TOTAL: &str = "hotelcal_holds_expired_total";

// ── Transaction health ──────────────────────────────────────────

/// Counter: room lock waits that hit the timeout.
pub const LOCK_TIMEOUTS_TOTAL: &str = "hotelcal_lock_timeouts_total";

/// Counter: transactions retried after a transient abort. Labels: op.
pub const TRANSACTION_RETRIES_TOTAL: &str = "hotelcal_transaction_retries_total";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: open client connections.
pub const CONNECTIONS_ACTIVE: &str = "hotelcal_connections_active";

/// Counter: connections accepted.
pub const CONNECTIONS_TOTAL: &str = "hotelcal_connections_total";

/// Counter: connections refused at the limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "hotelcal_connections_rejected_total";

/// Histogram: journal group-commit flush duration in seconds.
pub const JOURNAL_FLUSH_DURATION_SECONDS: &str = "hotelcal_journal_flush_duration_seconds";

/// Histogram: records per group commit.
pub const JOURNAL_FLUSH_BATCH_SIZE: &str = "hotelcal_journal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None; an
/// exporter that fails to start is logged and the server runs without it.
pub fn init(port: Option<u16>) {
    let Some(port) = port else { return };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    match metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
    {
        Ok(()) => tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics"),
        Err(e) => tracing::error!("metrics exporter not started: {e}"),
    }
}

/// Short metric label for a request.
pub fn op_label(request: &Request) -> &'static str {
    match request {
        Request::Search { .. } => "search",
        Request::Check { .. } => "check",
        Request::Calendar { .. } => "calendar",
        Request::Book { .. } => "book",
        Request::Hold { .. } => "hold",
        Request::ConfirmHold { .. } => "confirm_hold",
        Request::GetBooking { .. } => "get_booking",
        Request::UpdateBooking { .. } => "update_booking",
        Request::CancelBooking { .. } => "cancel_booking",
        Request::ProcessRefund { .. } => "process_refund",
        Request::BookingsForRoom { .. } => "bookings_for_room",
        Request::CreateReceipt { .. } => "create_receipt",
        Request::GetReceipt { .. } => "get_receipt",
        Request::UpdateReceipt { .. } => "update_receipt",
        Request::DeleteReceipt { .. } => "delete_receipt",
        Request::ListReceipts { .. } => "list_receipts",
        Request::CreateRoomType { .. } => "create_room_type",
        Request::ListRoomTypes => "list_room_types",
        Request::CreateRoom { .. } => "create_room",
        Request::ListRooms => "list_rooms",
    }
}
