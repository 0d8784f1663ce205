//! Prometheus metrics exposition
//!
//! Series recorded by the monitor:
//!
//! - `monitor_polls_total` (counter): labels `site`, `outcome`
//! - `monitor_poll_duration_seconds` (histogram): label `site`
//! - `monitor_restocks_total` (counter): label `site`
//! - `monitor_latency_anomalies_total` (counter): label `site`
//! - `monitor_notifications_total` (counter): labels `kind`, `result`
//!
//! `credential_refreshes_total` is recorded by the credential pool crate.

use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusHandle};

const POLL_DURATION: &str = "monitor_poll_duration_seconds";

/// 5ms to 20s, covering cached ban pages up to the longest request timeout.
const POLL_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.15, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 15.0, 20.0,
];

fn builder() -> Result<PrometheusBuilder, BuildError> {
    PrometheusBuilder::new()
        .set_buckets_for_metric(Matcher::Full(POLL_DURATION.to_string()), POLL_BUCKETS)
}

/// Install the Prometheus recorder and return a handle for rendering metrics.
///
/// The explicit buckets make the poll duration render as a Prometheus
/// histogram (`_bucket` lines) rather than a summary.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    builder()?.install_recorder()
}

/// Record one poll with its outcome label (`ok` or an `ErrorKind` label).
pub fn record_poll(site: &str, outcome: &str, duration_secs: Option<f64>) {
    metrics::counter!("monitor_polls_total", "site" => site.to_string(), "outcome" => outcome.to_string())
        .increment(1);
    if let Some(secs) = duration_secs {
        metrics::histogram!(POLL_DURATION, "site" => site.to_string()).record(secs);
    }
}

/// Record a dispatched restock.
pub fn record_restock(site: &str) {
    metrics::counter!("monitor_restocks_total", "site" => site.to_string()).increment(1);
}

/// Record a latency anomaly.
pub fn record_latency_anomaly(site: &str) {
    metrics::counter!("monitor_latency_anomalies_total", "site" => site.to_string()).increment(1);
}

/// Record a delivery attempt outcome. `kind` is `webhook`, `restock_server` or `alert`.
pub fn record_notification(kind: &'static str, result: &'static str) {
    metrics::counter!("monitor_notifications_total", "kind" => kind, "result" => result)
        .increment(1);
}
