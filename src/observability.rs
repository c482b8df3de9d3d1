use std::net::SocketAddr;

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::sql::{Command, StatsGrouping};

// ── Request metrics ─────────────────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "fitslot_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "fitslot_query_duration_seconds";

/// Counter: booking attempts. Labels: outcome, payment_method.
pub const BOOKINGS_TOTAL: &str = "fitslot_bookings_total";

/// Histogram: book_slot latency in seconds, lock waits included.
pub const BOOKING_DURATION_SECONDS: &str = "fitslot_booking_duration_seconds";

/// Counter: cancellation attempts. Labels: outcome.
pub const CANCELLATIONS_TOTAL: &str = "fitslot_cancellations_total";

/// Counter: committed ledger lines. Labels: type.
pub const WALLET_TRANSACTIONS_TOTAL: &str = "fitslot_wallet_transactions_total";

/// Counter: notifications the sink failed to deliver. Labels: kind.
pub const NOTIFICATIONS_FAILED_TOTAL: &str = "fitslot_notifications_failed_total";

/// Counter: subscriptions moved to `expired` by the sweeper.
pub const SUBSCRIPTIONS_EXPIRED_TOTAL: &str = "fitslot_subscriptions_expired_total";

// ── Resource metrics ────────────────────────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "fitslot_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "fitslot_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "fitslot_connections_rejected_total";

/// Counter: exclusive lock waits that hit the timeout.
pub const LOCK_WAIT_TIMEOUTS_TOTAL: &str = "fitslot_lock_wait_timeouts_total";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "fitslot_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (records per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "fitslot_wal_flush_batch_size";

/// Install the Prometheus exporter on `port`. No-op if port is None.
pub fn init(port: Option<u16>) -> Result<(), BuildError> {
    let Some(port) = port else { return Ok(()) };
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!("metrics endpoint: http://0.0.0.0:{port}/metrics");
    Ok(())
}

pub fn command_label(cmd: &Command) -> &'static str {
    match cmd {
        Command::InsertUser { .. } => "insert_user",
        Command::InsertSlot { .. } => "insert_slot",
        Command::InsertSubscription { .. } => "insert_subscription",
        Command::InsertTopUp { .. } => "insert_topup",
        Command::InsertBooking { .. } => "insert_booking",
        Command::DeleteBooking { .. } => "delete_booking",
        Command::SelectUser { .. } => "select_user",
        Command::SelectSlot { .. } => "select_slot",
        Command::SelectWallet { .. } => "select_wallet",
        Command::SelectTransactions { .. } => "select_wallet_transactions",
        Command::SelectBookings { .. } => "select_bookings",
        Command::SelectSubscriptions { .. } => "select_subscriptions",
        Command::SelectGymBookings { .. } => "select_gym_bookings",
        Command::SelectStats {
            grouping: StatsGrouping::Day,
            ..
        } => "select_booking_stats_by_day",
        Command::SelectStats {
            grouping: StatsGrouping::Gym,
            ..
        } => "select_booking_stats_by_gym",
    }
}
