// HTTP surface tests over the in-memory store and a scripted ERP.
// Run with: cargo test --test handlers_tests

mod common;

use std::sync::Arc;

use axum::http::StatusCode;
use axum_test::TestServer;
use serde_json::{json, Value};

use common::{committed_customer, default_rule_records, harness, FakeErp, Harness};
use customer_erp_sync::config::SchedulerConfig;
use customer_erp_sync::create_app;
use customer_erp_sync::handlers::AppState;
use customer_erp_sync::repositories::InMemorySyncStore;
use customer_erp_sync::services::erp::ErpSyncScheduler;

fn server_for(h: &Harness) -> TestServer {
    let scheduler = Arc::new(ErpSyncScheduler::new(h.service.clone(), SchedulerConfig::default()));
    TestServer::new(create_app(AppState::new(scheduler))).unwrap()
}

#[tokio::test]
async fn test_health_endpoint() {
    let h = harness(FakeErp::new(), InMemorySyncStore::new(), 100);
    let server = server_for(&h);

    let response = server.get("/api/erp-sync/health").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "customer-erp-sync");
}

#[tokio::test]
async fn test_status_reports_idle_scheduler() {
    let h = harness(FakeErp::new(), InMemorySyncStore::new(), 100);
    let server = server_for(&h);

    let response = server.get("/api/erp-sync/status").await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["running"], false);
    assert_eq!(body["pull_in_progress"], false);
    assert_eq!(body["push_in_progress"], false);
    assert_eq!(body["config"]["erp_pull"]["interval_seconds"], 3600);
    assert!(body["last_runs"]["pull"].is_null());
}

#[tokio::test]
async fn test_trigger_push_returns_run_stats() {
    let store = InMemorySyncStore::new();
    store.seed_customer(committed_customer("13900000009", "Initech")).await;
    let h = harness(FakeErp::new(), store, 100);
    let server = server_for(&h);

    let response = server
        .post("/api/erp-sync/trigger")
        .json(&json!({ "direction": "push" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::OK);

    let body: Value = response.json();
    assert_eq!(body["push"]["status"], "completed");
    assert_eq!(body["push"]["stats"]["created"], 1);
    assert!(body.get("pull").is_none());

    let status: Value = server.get("/api/erp-sync/status").await.json();
    assert_eq!(status["last_runs"]["push"]["outcome"]["status"], "completed");
}

#[tokio::test]
async fn test_trigger_rejects_unknown_direction() {
    let h = harness(FakeErp::new(), InMemorySyncStore::new(), 100);
    let server = server_for(&h);

    let response = server
        .post("/api/erp-sync/trigger")
        .json(&json!({ "direction": "sideways" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
    assert!(h.erp.calls().is_empty());
}

#[tokio::test]
async fn test_trigger_rejects_malformed_body() {
    let h = harness(FakeErp::new(), InMemorySyncStore::new(), 100);
    let server = server_for(&h);

    let response = server.post("/api/erp-sync/trigger").text("pull").await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);

    let response = server
        .post("/api/erp-sync/trigger")
        .json(&json!({ "dir": "pull" }))
        .await;
    assert_eq!(response.status_code(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_rules_listing_and_reload() {
    let h = harness(FakeErp::new(), InMemorySyncStore::new(), 100);
    let server = server_for(&h);

    let body: Value = server.get("/api/erp-sync/rules").await.json();
    assert_eq!(body["source"], "defaults");
    let names: Vec<&str> = body["rules"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["name"].as_str().unwrap())
        .collect();
    assert_eq!(names, vec!["mandatory", "high_quality", "medium_quality", "low_quality"]);

    h.store.set_rules(default_rule_records()).await;

    let response = server.post("/api/erp-sync/rules/reload").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    let body: Value = response.json();
    assert_eq!(body["source"], "store");
    assert_eq!(body["rule_count"], 4);

    let body: Value = server.get("/api/erp-sync/rules").await.json();
    assert_eq!(body["source"], "store");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_request_counter() {
    let h = harness(FakeErp::new(), InMemorySyncStore::new(), 100);
    let server = server_for(&h);

    server.get("/api/erp-sync/health").await;

    let response = server.get("/metrics").await;
    assert_eq!(response.status_code(), StatusCode::OK);
    assert!(response.text().contains("erp_sync_http_requests_total"));
}
