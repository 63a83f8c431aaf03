//! Metrics module for hours-service.
//! Prometheus metrics for change-request admission, hours consumption and
//! per-tenant administrative operations.

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_counter_vec, register_histogram_vec, register_int_counter_vec,
    CounterVec, Encoder, HistogramVec, IntCounterVec, TextEncoder,
};
use std::sync::OnceLock;

/// Database query duration histogram
pub static DB_QUERY_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        histogram_opts!("hours_db_query_duration_seconds", "Database query duration"),
        &["operation"]
    )
    .expect("Failed to register DB_QUERY_DURATION")
});

/// Change-request decisions by outcome (per-tenant metering)
pub static CHANGE_REQUEST_DECISIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Hours drawn from each bucket by accepted change requests
pub static HOURS_CONSUMED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Conditional writes that lost a race
pub static STALE_WRITES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Subscription and hours administration (per-tenant metering)
pub static ADMIN_OPERATIONS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request counter
pub static GRPC_REQUESTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// gRPC request duration histogram
pub static GRPC_REQUEST_DURATION: OnceLock<HistogramVec> = OnceLock::new();

/// Error counter for alerting
pub static ERRORS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Initialize all metrics. Call once at startup.
pub fn init_metrics() {
    CHANGE_REQUEST_DECISIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "hours_change_request_decisions_total",
                "Change-request admission decisions by tenant and outcome"
            ),
            &["tenant_id", "decision"]
        )
        .expect("Failed to register CHANGE_REQUEST_DECISIONS_TOTAL")
    });

    HOURS_CONSUMED_TOTAL.get_or_init(|| {
        register_counter_vec!(
            opts!(
                "hours_consumed_total",
                "Hours consumed by accepted change requests, by bucket"
            ),
            &["tenant_id", "bucket"]
        )
        .expect("Failed to register HOURS_CONSUMED_TOTAL")
    });

    STALE_WRITES_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "hours_stale_writes_total",
                "Conditional writes rejected by a concurrent update"
            ),
            &["operation", "outcome"]
        )
        .expect("Failed to register STALE_WRITES_TOTAL")
    });

    ADMIN_OPERATIONS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!(
                "hours_admin_operations_total",
                "Administrative operations by tenant and operation type"
            ),
            &["tenant_id", "operation"]
        )
        .expect("Failed to register ADMIN_OPERATIONS_TOTAL")
    });

    GRPC_REQUESTS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("hours_grpc_requests_total", "Total gRPC requests"),
            &["method", "status"]
        )
        .expect("Failed to register GRPC_REQUESTS_TOTAL")
    });

    GRPC_REQUEST_DURATION.get_or_init(|| {
        register_histogram_vec!(
            histogram_opts!(
                "hours_grpc_request_duration_seconds",
                "gRPC request duration",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
            ),
            &["method"]
        )
        .expect("Failed to register GRPC_REQUEST_DURATION")
    });

    ERRORS_TOTAL.get_or_init(|| {
        register_int_counter_vec!(
            opts!("hours_errors_total", "Total errors by type for alerting"),
            &["error_type", "method"]
        )
        .expect("Failed to register ERRORS_TOTAL")
    });

    // Force initialization of lazy statics
    let _ = &*DB_QUERY_DURATION;
}

/// Get metrics in Prometheus text format.
pub fn get_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Record a change-request decision.
pub fn record_decision(tenant_id: &str, decision: &str) {
    if let Some(counter) = CHANGE_REQUEST_DECISIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, decision]).inc();
    }
}

/// Record hours drawn from a bucket.
pub fn record_hours_consumed(tenant_id: &str, bucket: &str, hours: f64) {
    if hours <= 0.0 {
        return;
    }
    if let Some(counter) = HOURS_CONSUMED_TOTAL.get() {
        counter.with_label_values(&[tenant_id, bucket]).inc_by(hours);
    }
}

/// Record a stale write and whether it was retried or surfaced.
pub fn record_stale_write(operation: &str, outcome: &str) {
    if let Some(counter) = STALE_WRITES_TOTAL.get() {
        counter.with_label_values(&[operation, outcome]).inc();
    }
}

/// Record an administrative operation.
pub fn record_admin_operation(tenant_id: &str, operation: &str) {
    if let Some(counter) = ADMIN_OPERATIONS_TOTAL.get() {
        counter.with_label_values(&[tenant_id, operation]).inc();
    }
}

/// Record a gRPC request.
pub fn record_grpc_request(method: &str, status: &str) {
    if let Some(counter) = GRPC_REQUESTS_TOTAL.get() {
        counter.with_label_values(&[method, status]).inc();
    }
}

/// Record gRPC request duration.
pub fn record_grpc_request_duration(method: &str, duration_secs: f64) {
    if let Some(histogram) = GRPC_REQUEST_DURATION.get() {
        histogram.with_label_values(&[method]).observe(duration_secs);
    }
}

/// Record an error for alerting.
pub fn record_error(error_type: &str, method: &str) {
    if let Some(counter) = ERRORS_TOTAL.get() {
        counter.with_label_values(&[error_type, method]).inc();
    }
}
