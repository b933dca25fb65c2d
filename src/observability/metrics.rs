//! Metrics collection and exposition.
//!
//! # Metrics
//! - `gateway_requests_total` (counter): requests by route, method, status
//! - `gateway_request_duration_seconds` (histogram): end-to-end latency
//! - `gateway_aggregations_total` (counter): aggregator runs by filter, outcome
//! - `gateway_sub_request_duration_seconds` (histogram): per sub-target latency
//! - `gateway_upstream_requests_total` (counter): proxy forwards by backend, status
//! - `gateway_upstream_duration_seconds` (histogram): proxy forward latency
//!
//! # Design Decisions
//! - Low-overhead metric updates (atomic operations)
//! - Recording is a no-op until `init_metrics` installs the exporter

use std::net::SocketAddr;
use std::time::Instant;

use ::metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;

/// Metric names as constants for consistency.
pub mod names {
    pub const REQUESTS_TOTAL: &str = "gateway_requests_total";
    pub const REQUEST_DURATION_SECONDS: &str = "gateway_request_duration_seconds";
    pub const AGGREGATIONS_TOTAL: &str = "gateway_aggregations_total";
    pub const SUB_REQUEST_DURATION_SECONDS: &str = "gateway_sub_request_duration_seconds";
    pub const UPSTREAM_REQUESTS_TOTAL: &str = "gateway_upstream_requests_total";
    pub const UPSTREAM_DURATION_SECONDS: &str = "gateway_upstream_duration_seconds";
}

/// Install the Prometheus exporter listening on `addr`.
pub fn init_metrics(addr: SocketAddr) -> Result<(), String> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| format!("Failed to install Prometheus exporter: {e}"))?;

    describe_counter!(names::REQUESTS_TOTAL, "Total number of requests served");
    describe_histogram!(
        names::REQUEST_DURATION_SECONDS,
        "Request duration in seconds"
    );
    describe_counter!(
        names::AGGREGATIONS_TOTAL,
        "Total number of aggregations by outcome"
    );
    describe_histogram!(
        names::SUB_REQUEST_DURATION_SECONDS,
        "Aggregator sub-request duration in seconds"
    );
    describe_counter!(
        names::UPSTREAM_REQUESTS_TOTAL,
        "Total number of requests forwarded to backends"
    );
    describe_histogram!(
        names::UPSTREAM_DURATION_SECONDS,
        "Backend request duration in seconds"
    );

    tracing::info!(addr = %addr, "Prometheus metrics endpoint started");
    Ok(())
}

/// Record a served request.
pub fn record_request(route: &str, method: &str, status: u16, start: Instant) {
    let status = status.to_string();
    counter!(names::REQUESTS_TOTAL, "route" => route.to_string(), "method" => method.to_string(), "status" => status.clone())
        .increment(1);
    histogram!(names::REQUEST_DURATION_SECONDS, "route" => route.to_string(), "status" => status)
        .record(start.elapsed().as_secs_f64());
}

/// Record the outcome of one aggregation.
pub fn record_aggregation(filter: &str, outcome: &'static str) {
    counter!(names::AGGREGATIONS_TOTAL, "filter" => filter.to_string(), "outcome" => outcome)
        .increment(1);
}

/// Record the duration of one aggregator sub-request.
pub fn record_sub_request(filter: &str, pipeline: &str, start: Instant) {
    histogram!(names::SUB_REQUEST_DURATION_SECONDS, "filter" => filter.to_string(), "pipeline" => pipeline.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// Record one proxy forward.
pub fn record_upstream(backend: &str, status: u16, start: Instant) {
    counter!(names::UPSTREAM_REQUESTS_TOTAL, "backend" => backend.to_string(), "status" => status.to_string())
        .increment(1);
    histogram!(names::UPSTREAM_DURATION_SECONDS, "backend" => backend.to_string())
        .record(start.elapsed().as_secs_f64());
}
