// ============================================================================
// Prometheus Metrics
// ============================================================================
//
// ## Metrics Collected:
//
// 1. **HTTP Requests**
//    - Histogram: erp_sync_http_request_duration_seconds {method, path, status}
//    - Counter: erp_sync_http_requests_total {method, path, status}
//
// 2. **Sync Records**
//    - Counter: erp_sync_records_total {direction, outcome}
//      outcome: created | updated | skipped | failed
//
// 3. **Sync Runs**
//    - Counter: erp_sync_runs_total {direction, result}
//      result: completed | partial | failed | already_running
//    - Histogram: erp_sync_run_duration_seconds {direction}
//
// 4. **Rule Matches**
//    - Counter: erp_sync_rule_matches_total {rule}
//
// ## Endpoints:
//
// - GET /metrics - Prometheus scrape endpoint
//
// ============================================================================

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::time::Instant;

use crate::models::SyncStats;

// ============================================================================
// PROMETHEUS METRICS REGISTRY
// ============================================================================

lazy_static! {
    pub static ref HTTP_REQUEST_DURATION: HistogramVec = register_histogram_vec!(
        "erp_sync_http_request_duration_seconds",
        "HTTP request latency in seconds",
        &["method", "path", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0]
    ).unwrap();

    pub static ref HTTP_REQUESTS_TOTAL: CounterVec = register_counter_vec!(
        "erp_sync_http_requests_total",
        "Total number of HTTP requests",
        &["method", "path", "status"]
    ).unwrap();

    /// Per-record outcomes of pull and push runs
    pub static ref SYNC_RECORDS_TOTAL: CounterVec = register_counter_vec!(
        "erp_sync_records_total",
        "Customer records processed by sync runs",
        &["direction", "outcome"]
    ).unwrap();

    pub static ref SYNC_RUNS_TOTAL: CounterVec = register_counter_vec!(
        "erp_sync_runs_total",
        "Sync runs by direction and result",
        &["direction", "result"]
    ).unwrap();

    pub static ref SYNC_RUN_DURATION: HistogramVec = register_histogram_vec!(
        "erp_sync_run_duration_seconds",
        "Wall-clock duration of sync runs",
        &["direction"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0]
    ).unwrap();

    pub static ref SYNC_RULE_MATCHES_TOTAL: CounterVec = register_counter_vec!(
        "erp_sync_rule_matches_total",
        "Push decisions by matched rule",
        &["rule"]
    ).unwrap();
}

/// Simplify path for metrics (remove IDs)
///
/// Example: /api/customers/123 -> /api/customers/:id
fn normalize_path(path: &str) -> String {
    let normalized: Vec<&str> = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            if segment.parse::<i64>().is_ok() || (segment.len() == 36 && segment.contains('-')) {
                ":id"
            } else {
                segment
            }
        })
        .collect();

    format!("/{}", normalized.join("/"))
}

// ============================================================================
// METRICS MIDDLEWARE
// ============================================================================

pub async fn metrics_middleware(request: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = request.method().clone();
    let path = normalize_path(request.uri().path());

    let response = next.run(request).await;

    let duration = start.elapsed();
    let status_str = response.status().as_u16().to_string();

    HTTP_REQUEST_DURATION
        .with_label_values(&[method.as_str(), &path, &status_str])
        .observe(duration.as_secs_f64());
    HTTP_REQUESTS_TOTAL
        .with_label_values(&[method.as_str(), &path, &status_str])
        .inc();

    tracing::debug!(
        target: "metrics",
        method = %method,
        path = %path,
        status = %status_str,
        duration_ms = %duration.as_millis(),
        "HTTP request completed"
    );

    response
}

// ============================================================================
// METRICS ENDPOINT HANDLER
// ============================================================================

/// Returns Prometheus-formatted metrics for scraping
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => (
            StatusCode::OK,
            [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            buffer,
        ),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4")],
                format!("Failed to encode metrics: {}", e).into_bytes(),
            )
        }
    }
}

// ============================================================================
// HELPER FUNCTIONS FOR APPLICATION USE
// ============================================================================

pub fn record_rule_match(rule: &str) {
    SYNC_RULE_MATCHES_TOTAL.with_label_values(&[rule]).inc();
}

/// Record the counters and duration of a finished run.
pub fn record_sync_run(stats: &SyncStats) {
    let direction = stats.direction.job_name();

    for (outcome, count) in [
        ("created", stats.created),
        ("updated", stats.updated),
        ("skipped", stats.skipped),
        ("failed", stats.failed),
    ] {
        if count > 0 {
            SYNC_RECORDS_TOTAL
                .with_label_values(&[direction, outcome])
                .inc_by(count as f64);
        }
    }

    let result = if stats.partial { "partial" } else { "completed" };
    SYNC_RUNS_TOTAL.with_label_values(&[direction, result]).inc();
    SYNC_RUN_DURATION
        .with_label_values(&[direction])
        .observe(stats.duration_secs());
}

/// Record a run that did not produce statistics (`failed`, `already_running`).
pub fn record_sync_run_result(direction: &str, result: &str) {
    SYNC_RUNS_TOTAL.with_label_values(&[direction, result]).inc();
}

// ============================================================================
// TESTS
// ============================================================================
