//! Prometheus metrics exposition
//!
//! Request-path metrics recorded by the gateway service:
//!
//! - `gateway_requests_total` (counter): labels `status`, `method`, `route`
//! - `gateway_request_duration_seconds` (histogram): label `status`
//! - `gateway_upstream_errors_total` (counter): label `error_type`
//! - `gateway_auth_failures_total` (counter): label `error_type`
//! - `gateway_tokens_total` (counter): label `direction`
//!
//! Refresh and token-count metrics are emitted by their own crates and land
//! in the same recorder.

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Bucket boundaries from 5ms up to the ten minute upstream timeout.
const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0, 300.0, 600.0,
];

fn builder() -> Result<PrometheusBuilder> {
    let builder = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full("gateway_request_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("setting request duration buckets")?
        .set_buckets_for_metric(
            Matcher::Full("gateway_refresh_duration_seconds".to_string()),
            DURATION_BUCKETS,
        )
        .context("setting refresh duration buckets")?;
    Ok(builder)
}

/// Install the global Prometheus recorder and return a handle for rendering.
///
/// Histograms get explicit buckets so they render `_bucket` lines rather
/// than summaries.
pub fn install_recorder() -> Result<PrometheusHandle> {
    builder()?
        .install_recorder()
        .context("installing Prometheus recorder")
}

/// Record a completed request.
pub fn record_request(status: u16, method: &str, route: &'static str, duration_secs: f64) {
    let status_str = status.to_string();
    metrics::counter!(
        "gateway_requests_total",
        "status" => status_str.clone(),
        "method" => method.to_string(),
        "route" => route
    )
    .increment(1);
    metrics::histogram!("gateway_request_duration_seconds", "status" => status_str)
        .record(duration_secs);
}

pub fn record_upstream_error(error_type: &str) {
    metrics::counter!("gateway_upstream_errors_total", "error_type" => error_type.to_string())
        .increment(1);
}

pub fn record_auth_failure(error_type: &str) {
    metrics::counter!("gateway_auth_failures_total", "error_type" => error_type.to_string())
        .increment(1);
}

/// Billed tokens, split by direction.
pub fn record_tokens(input: u64, output: u64) {
    metrics::counter!("gateway_tokens_total", "direction" => "input").increment(input);
    metrics::counter!("gateway_tokens_total", "direction" => "output").increment(output);
}
