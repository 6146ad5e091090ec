//! Prometheus metrics for token-broker

use std::sync::OnceLock;
use std::time::{Duration, Instant};

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::Result;
use crate::error::Error;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static START_TIME: OnceLock<Instant> = OnceLock::new();

// Server metrics
const METRIC_UPTIME: &str = "token_broker_uptime_seconds";
const METRIC_INFO: &str = "token_broker_info";
const METRIC_CONNECTIONS_ACTIVE: &str = "token_broker_connections_active";
const METRIC_CONNECTIONS_TOTAL: &str = "token_broker_connections_total";
const METRIC_HANDSHAKE_FAILURES: &str = "token_broker_tls_handshake_failures_total";

// Issuance metrics
const METRIC_ISSUANCE_TOTAL: &str = "token_broker_issuance_total";
const METRIC_ISSUANCE_DURATION: &str = "token_broker_issuance_duration_seconds";

// Cache metrics
const METRIC_CACHE_HITS: &str = "token_broker_cache_hits_total";
const METRIC_CACHE_MISSES: &str = "token_broker_cache_misses_total";

// Audit and bootstrap metrics
const METRIC_AUDIT_DROPPED: &str = "token_broker_audit_dropped_total";
const METRIC_BOOTSTRAP: &str = "token_broker_bootstrap_principals_total";

/// Initialize Prometheus metrics recorder.
pub fn init_metrics() -> Result<()> {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| Error::Config(format!("Failed to install metrics recorder: {e}")))?;

    PROMETHEUS_HANDLE.set(handle).ok();
    START_TIME.set(Instant::now()).ok();

    register_metrics();
    tracing::info!("Prometheus metrics initialized");
    Ok(())
}

fn register_metrics() {
    describe_gauge!(METRIC_UPTIME, "Server uptime in seconds");
    describe_gauge!(METRIC_INFO, "Server information (always 1)");
    describe_gauge!(METRIC_CONNECTIONS_ACTIVE, "Open client connections");
    describe_counter!(METRIC_CONNECTIONS_TOTAL, "Accepted client connections");
    describe_counter!(METRIC_HANDSHAKE_FAILURES, "Failed or timed out TLS handshakes");

    describe_counter!(METRIC_ISSUANCE_TOTAL, "Token issuance attempts by outcome");
    describe_histogram!(
        METRIC_ISSUANCE_DURATION,
        "Token issuance latency in seconds by outcome"
    );

    describe_counter!(METRIC_CACHE_HITS, "Token cache hits");
    describe_counter!(METRIC_CACHE_MISSES, "Token cache misses");

    describe_counter!(
        METRIC_AUDIT_DROPPED,
        "Audit records dropped because the audit buffer was full"
    );
    describe_counter!(METRIC_BOOTSTRAP, "Principals reconciled at startup by action");

    gauge!(
        METRIC_INFO,
        "version" => env!("CARGO_PKG_VERSION"),
    )
    .set(1.0);
}

/// Render metrics in Prometheus text format.
#[must_use]
pub fn render_metrics() -> String {
    if let Some(start) = START_TIME.get() {
        gauge!(METRIC_UPTIME).set(start.elapsed().as_secs_f64());
    }

    PROMETHEUS_HANDLE
        .get()
        .map(PrometheusHandle::render)
        .unwrap_or_default()
}

/// Record one terminal issuance outcome.
pub fn record_issuance(outcome: &'static str, latency: Duration) {
    counter!(METRIC_ISSUANCE_TOTAL, "outcome" => outcome).increment(1);
    histogram!(METRIC_ISSUANCE_DURATION, "outcome" => outcome).record(latency.as_secs_f64());
}

/// Record a cache hit.
pub fn record_cache_hit() {
    counter!(METRIC_CACHE_HITS).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(METRIC_CACHE_MISSES).increment(1);
}

/// Record an audit record lost to a full buffer.
pub fn record_audit_dropped() {
    counter!(METRIC_AUDIT_DROPPED).increment(1);
}

pub fn record_connection_opened() {
    counter!(METRIC_CONNECTIONS_TOTAL).increment(1);
    gauge!(METRIC_CONNECTIONS_ACTIVE).increment(1.0);
}

pub fn record_connection_closed() {
    gauge!(METRIC_CONNECTIONS_ACTIVE).decrement(1.0);
}

pub fn record_handshake_failure() {
    counter!(METRIC_HANDSHAKE_FAILURES).increment(1);
}

/// Record a bootstrap action: `created`, `healed`, `unchanged` or `drifted`.
pub fn record_bootstrap(action: &'static str) {
    counter!(METRIC_BOOTSTRAP, "action" => action).increment(1);
}
