//! Prometheus metrics exporter.
//!
//! Counters and gauges are recorded throughout the crate with the `metrics`
//! macros; this module installs the global recorder and the scrape endpoint.
//! When no `metrics_bind` address is configured the macros are no-ops.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;

/// Install the global Prometheus recorder with an HTTP scrape endpoint.
/// Must be called from within a tokio runtime, at most once per process.
pub fn init_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;

    describe();
    info!(%addr, "metrics endpoint listening");
    Ok(())
}

fn describe() {
    metrics::describe_counter!(
        "hostgate_accepted_total",
        "TCP connections accepted, per gateway"
    );
    metrics::describe_counter!(
        "hostgate_connections_total",
        "Connections handed to the worker pool"
    );
    metrics::describe_gauge!(
        "hostgate_connections_active",
        "Connections currently being processed"
    );
    metrics::describe_counter!(
        "hostgate_no_route_total",
        "Handshakes whose hostname matched no backend"
    );
    metrics::describe_counter!(
        "hostgate_status_served_total",
        "Status queries answered, labeled by outcome"
    );
    metrics::describe_counter!(
        "hostgate_bytes_transferred_total",
        "Bytes relayed between clients and backends, both directions"
    );
    metrics::describe_counter!("hostgate_events_total", "Events emitted, labeled by kind");
    metrics::describe_counter!(
        "hostgate_worker_panics_total",
        "Connection tasks that panicked inside a pool worker"
    );
}
