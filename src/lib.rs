pub mod config;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;
pub mod utils;

use axum::{
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers::erp_sync::{get_rules, get_status, health_check, reload_rules, trigger_sync};
use crate::handlers::AppState;

/// Build the HTTP surface: sync operations under `/api/erp-sync` and the
/// Prometheus scrape endpoint.
pub fn create_app(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .nest(
            "/api/erp-sync",
            Router::new()
                .route("/health", get(health_check))
                .route("/status", get(get_status))
                .route("/trigger", post(trigger_sync))
                .route("/rules", get(get_rules))
                .route("/rules/reload", post(reload_rules)),
        )
        .route("/metrics", get(middleware::metrics_handler))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(axum_middleware::from_fn(middleware::metrics_middleware))
                .layer(cors),
        )
        .with_state(state)
}
