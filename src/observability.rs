use std::net::SocketAddr;

use tracing_subscriber::EnvFilter;

use crate::sql::Command;

// ── RED metrics (request-driven) ────────────────────────────────

/// Counter: total queries executed. Labels: command, status.
pub const QUERIES_TOTAL: &str = "milkrun_queries_total";

/// Histogram: query latency in seconds. Labels: command.
pub const QUERY_DURATION_SECONDS: &str = "milkrun_query_duration_seconds";

// ── USE metrics (resource utilization) ──────────────────────────

/// Gauge: active TCP connections.
pub const CONNECTIONS_ACTIVE: &str = "milkrun_connections_active";

/// Counter: total connections accepted.
pub const CONNECTIONS_TOTAL: &str = "milkrun_connections_total";

/// Counter: connections rejected due to limit.
pub const CONNECTIONS_REJECTED_TOTAL: &str = "milkrun_connections_rejected_total";

/// Gauge: number of active tenants (loaded engines).
pub const TENANTS_ACTIVE: &str = "milkrun_tenants_active";

/// Histogram: WAL group-commit flush duration in seconds.
pub const WAL_FLUSH_DURATION_SECONDS: &str = "milkrun_wal_flush_duration_seconds";

/// Histogram: WAL group-commit batch size (events per flush).
pub const WAL_FLUSH_BATCH_SIZE: &str = "milkrun_wal_flush_batch_size";

// ── Resolution health ───────────────────────────────────────────

/// Counter: records that failed resolution because stored data is inconsistent.
pub const INTEGRITY_ERRORS_TOTAL: &str = "milkrun_integrity_errors_total";

/// Counter: subscriptions treated as not scheduled because their mode data is unusable.
pub const RESOLUTION_ANOMALIES_TOTAL: &str = "milkrun_resolution_anomalies_total";

/// Install the global tracing subscriber. `RUST_LOG` wins; the default level is `info`.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

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
        Command::UpsertCustomer(_) => "upsert_customer",
        Command::SetCustomerStatus { .. } => "set_customer_status",
        Command::CreateSubscription(_) => "create_subscription",
        Command::SetSubscriptionStatus { .. } => "set_subscription_status",
        Command::ChangeShift { .. } => "set_permanent_shift",
        Command::ChangeQuantity { .. } => "set_permanent_quantity",
        Command::SetPause(_) => "set_pause",
        Command::ClearPause { .. } => "clear_pause",
        Command::Resume { .. } => "resume",
        Command::Stop { .. } => "stop",
        Command::StopProduct { .. } => "stop_product",
        Command::SetOverride(_) => "set_date_override",
        Command::ClearOverride { .. } => "clear_date_override",
        Command::AddProduct(_) => "add_one_off_product",
        Command::RemoveProduct { .. } => "remove_one_off_product",
        Command::SelectDeliveries { .. } => "select_deliveries",
        Command::SelectDeliveryList(_) => "select_delivery_list",
        Command::SelectProductTotals(_) => "select_product_totals",
        Command::SelectCalendar { .. } => "select_calendar",
        Command::SelectCustomers => "select_customers",
        Command::SelectSubscriptions { .. } => "select_subscriptions",
        Command::SelectPauses { .. } => "select_pauses",
        Command::SelectOverrides { .. } => "select_overrides",
        Command::SelectAdditions { .. } => "select_additions",
        Command::Listen { .. } => "listen",
        Command::Unlisten { .. } => "unlisten",
        Command::UnlistenAll => "unlisten_all",
    }
}
