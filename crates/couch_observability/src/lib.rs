//! Observability setup: structured logging and Prometheus metrics.

use metrics_exporter_prometheus::PrometheusBuilder;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Initialize the global tracing subscriber with structured logging.
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,couch=debug"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    // A host application may already have installed a subscriber.
    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init();
}

/// Initialize the Prometheus exporter listening on `listen_addr`.
pub fn init_metrics(listen_addr: &str) -> Result<(), Box<dyn std::error::Error>> {
    let addr: std::net::SocketAddr = listen_addr.parse()?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;
    tracing::info!("Prometheus metrics endpoint on http://{}/metrics", addr);
    Ok(())
}

/// One completed operation: `outcome` is `success`, `fatal`, `timeout`,
/// `exhausted` or `cancelled`.
pub fn record_operation_metrics(opcode: &str, outcome: &str, attempts: u32, duration_us: u64) {
    metrics::counter!(
        "couch_operations_total",
        "opcode" => opcode.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    metrics::histogram!("couch_operation_duration_us", "opcode" => opcode.to_string())
        .record(duration_us as f64);
    metrics::histogram!("couch_operation_attempts", "opcode" => opcode.to_string())
        .record(attempts as f64);
}

/// A retried attempt and the error class that caused it.
pub fn record_retry(opcode: &str, reason: &str) {
    metrics::counter!(
        "couch_operation_retries_total",
        "opcode" => opcode.to_string(),
        "reason" => reason.to_string()
    )
    .increment(1);
}

pub fn record_topology_change(bucket: &str, change: &str, revision: u64) {
    metrics::counter!(
        "couch_topology_changes_total",
        "bucket" => bucket.to_string(),
        "change" => change.to_string()
    )
    .increment(1);
    metrics::gauge!("couch_topology_revision", "bucket" => bucket.to_string()).set(revision as f64);
}

pub fn record_node_counts(bucket: &str, active: usize, unavailable: usize, retiring: usize) {
    metrics::gauge!("couch_nodes_active", "bucket" => bucket.to_string()).set(active as f64);
    metrics::gauge!("couch_nodes_unavailable", "bucket" => bucket.to_string()).set(unavailable as f64);
    metrics::gauge!("couch_nodes_retiring", "bucket" => bucket.to_string()).set(retiring as f64);
}
