use std::net::SocketAddr;

use metrics_exporter_prometheus::PrometheusBuilder;

pub const TICKS_DELIVERED: &str = "exchange_ticks_delivered_total";
pub const ORDERS_CREATED: &str = "exchange_orders_created_total";
pub const ORDERS_CANCELLED: &str = "exchange_orders_cancelled_total";
pub const FILLS: &str = "exchange_fills_total";
pub const FILLS_DROPPED: &str = "exchange_fills_dropped_total";
pub const BARS_EMITTED: &str = "exchange_bars_emitted_total";
pub const BOOK_ORDERS: &str = "exchange_book_orders";
pub const RESULTS_SUBSCRIBERS: &str = "exchange_results_subscribers";
pub const STATISTIC_SUBSCRIBERS: &str = "exchange_statistic_subscribers";

/// Installs the global recorder and serves `/metrics` on `addr`.
/// Must run inside a tokio runtime.
pub fn install_recorder(addr: SocketAddr) -> anyhow::Result<()> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    Ok(())
}
