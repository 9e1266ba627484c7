//! Lightweight metrics helpers for Portico.
//!
//! This module exposes a small set of convenience functions and RAII timers
//! wrapping the `metrics` crate macros. It intentionally avoids embedding a
//! concrete exporter (the application can initialize any compatible recorder
//! externally) while still documenting Portico-specific metric names.
//!
//! Provided metrics (labels vary by family):
//! * `portico_requests_total` (counter)
//! * `portico_request_duration_seconds` (histogram)
//! * `portico_upstream_requests_total` (counter)
//! * `portico_upstream_request_duration_seconds` (histogram)
//! * `portico_destination_health_status` (gauge per destination)
//! * `portico_active_requests` (gauge)
//! * `portico_rate_limit_rejections_total` (counter)
//! * `portico_circuit_transitions_total` (counter, labels: destination, state)
//!
//! The `*Timer` structs leverage `Drop` to record durations safely even when
//! early returns or errors occur.
use std::{collections::HashMap, sync::Mutex, time::Instant};

use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use once_cell::sync::Lazy;

pub const PORTICO_REQUESTS_TOTAL: &str = "portico_requests_total";
pub const PORTICO_REQUEST_DURATION_SECONDS: &str = "portico_request_duration_seconds";
pub const PORTICO_UPSTREAM_REQUESTS_TOTAL: &str = "portico_upstream_requests_total";
pub const PORTICO_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "portico_upstream_request_duration_seconds";
pub const PORTICO_DESTINATION_HEALTH_STATUS: &str = "portico_destination_health_status";
pub const PORTICO_ACTIVE_REQUESTS: &str = "portico_active_requests";
pub const PORTICO_RATE_LIMIT_REJECTIONS_TOTAL: &str = "portico_rate_limit_rejections_total";
pub const PORTICO_CIRCUIT_TRANSITIONS_TOTAL: &str = "portico_circuit_transitions_total";

/// Storage for destination health gauges (also backs ad-hoc JSON exports).
pub static DESTINATION_HEALTH_GAUGES: Lazy<Mutex<HashMap<String, f64>>> = Lazy::new(|| {
    describe_gauge!(
        PORTICO_DESTINATION_HEALTH_STATUS,
        "Health status of individual destinations (1 for healthy, 0 for unhealthy)"
    );
    describe_counter!(
        PORTICO_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests processed by the gateway."
    );
    describe_histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests processed by the gateway."
    );
    describe_counter!(
        PORTICO_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of HTTP requests forwarded to upstream destinations."
    );
    describe_histogram!(
        PORTICO_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of HTTP requests forwarded to upstream destinations."
    );
    describe_gauge!(
        PORTICO_ACTIVE_REQUESTS,
        "Number of currently active requests being processed."
    );
    describe_counter!(
        PORTICO_RATE_LIMIT_REJECTIONS_TOTAL,
        Unit::Count,
        "Requests rejected by the admission rate limiter."
    );
    describe_counter!(
        PORTICO_CIRCUIT_TRANSITIONS_TOTAL,
        Unit::Count,
        "Circuit breaker state transitions (by destination and new state)."
    );

    Mutex::new(HashMap::new())
});

/// Set (and record) the health status gauge for a destination.
pub fn set_destination_health_status(destination: &str, is_healthy: bool) {
    let health_value = if is_healthy { 1.0 } else { 0.0 };

    if let Ok(mut gauges) = DESTINATION_HEALTH_GAUGES.lock() {
        gauges.insert(destination.to_string(), health_value);
    } else {
        tracing::error!("Failed to acquire lock for destination health gauges");
        return;
    }

    gauge!(PORTICO_DESTINATION_HEALTH_STATUS, "destination" => destination.to_string())
        .set(health_value);
}

/// Increment the total request counter for an inbound gateway request.
pub fn increment_request_total(path: &str, method: &str, status: u16) {
    counter!(
        PORTICO_REQUESTS_TOTAL,
        "path" => path.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed inbound request's duration.
pub fn record_request_duration(path: &str, method: &str, duration: std::time::Duration) {
    histogram!(
        PORTICO_REQUEST_DURATION_SECONDS,
        "path" => path.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Increment total count of proxied upstream requests.
pub fn increment_upstream_request_total(destination: &str, method: &str, status: u16) {
    counter!(
        PORTICO_UPSTREAM_REQUESTS_TOTAL,
        "destination" => destination.to_string(),
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a completed upstream request duration.
pub fn record_upstream_request_duration(
    destination: &str,
    method: &str,
    duration: std::time::Duration,
) {
    histogram!(
        PORTICO_UPSTREAM_REQUEST_DURATION_SECONDS,
        "destination" => destination.to_string(),
        "method" => method.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set current active in-flight request count.
pub fn set_active_requests(count: u64) {
    gauge!(PORTICO_ACTIVE_REQUESTS).set(count as f64);
}

/// Count one admission rejection.
pub fn increment_rate_limit_rejection() {
    counter!(PORTICO_RATE_LIMIT_REJECTIONS_TOTAL).increment(1);
}

/// Count one circuit transition into `state` for a destination.
pub fn increment_circuit_transition(destination: &str, state: &str) {
    counter!(
        PORTICO_CIRCUIT_TRANSITIONS_TOTAL,
        "destination" => destination.to_string(),
        "state" => state.to_string()
    )
    .increment(1);
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    path: String,
    method: String,
}

impl RequestTimer {
    pub fn new(path: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            path: path.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.path, &self.method, self.start.elapsed());
    }
}

/// RAII helper measuring upstream request duration.
pub struct UpstreamRequestTimer {
    start: Instant,
    destination: String,
    method: String,
}

impl UpstreamRequestTimer {
    pub fn new(destination: &str, method: &str) -> Self {
        Self {
            start: Instant::now(),
            destination: destination.to_string(),
            method: method.to_string(),
        }
    }
}

impl Drop for UpstreamRequestTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(&self.destination, &self.method, self.start.elapsed());
    }
}

/// Initialize metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    tracing::info!("Initializing Portico metrics system");
    Lazy::force(&DESTINATION_HEALTH_GAUGES);
    Ok(())
}

/// Collect a snapshot of gauge values used for ad-hoc exports.
pub fn get_current_metrics() -> HashMap<String, f64> {
    let mut metrics = HashMap::new();

    if let Ok(gauges) = DESTINATION_HEALTH_GAUGES.lock() {
        for (destination, health) in gauges.iter() {
            metrics.insert(format!("destination_health_{destination}"), *health);
        }
    }

    metrics
}
