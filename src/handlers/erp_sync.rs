// ERP Sync Operational Endpoints
// Health, status, manual trigger and rule management for the sync scheduler.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    response::Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::SchedulerConfig;
use crate::middleware::error_handling::{AppError, Result};
use crate::services::erp::{
    ErpSyncScheduler, JobHistory, RuleSource, SyncRuleEngine, TriggerDirection, TriggerReport,
};
use crate::utils::sanitize_for_log;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: Arc<ErpSyncScheduler>,
    pub engine: Arc<SyncRuleEngine>,
}

impl AppState {
    pub fn new(scheduler: Arc<ErpSyncScheduler>) -> Self {
        let engine = scheduler.service().rule_engine().clone();
        Self { scheduler, engine }
    }
}

// ============================================================================
// Request/Response DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct TriggerRequest {
    pub direction: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub running: bool,
    pub pull_in_progress: bool,
    pub push_in_progress: bool,
    pub config: SchedulerConfig,
    pub last_runs: JobHistory,
    pub checked_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct RuleView {
    pub name: String,
    pub kind: String,
    pub priority: i32,
    pub description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RulesResponse {
    pub source: RuleSource,
    pub rules: Vec<RuleView>,
    pub pending_match_counts: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct ReloadResponse {
    pub source: RuleSource,
    pub rule_count: usize,
}

// ============================================================================
// Handlers
// ============================================================================

/// GET /api/erp-sync/health
pub async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "customer-erp-sync",
        "timestamp": Utc::now(),
    }))
}

/// GET /api/erp-sync/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    use crate::models::SyncDirection;

    let service = state.scheduler.service();
    Json(StatusResponse {
        running: state.scheduler.is_running().await,
        pull_in_progress: service.is_running(SyncDirection::ErpToLocal),
        push_in_progress: service.is_running(SyncDirection::LocalToErp),
        config: state.scheduler.config().clone(),
        last_runs: state.scheduler.history().await,
        checked_at: Utc::now(),
    })
}

/// POST /api/erp-sync/trigger
///
/// Runs the requested job(s) to completion before answering.
pub async fn trigger_sync(
    State(state): State<AppState>,
    payload: std::result::Result<Json<TriggerRequest>, JsonRejection>,
) -> Result<Json<TriggerReport>> {
    let Json(request) = payload?;

    let direction: TriggerDirection = request.direction.parse().map_err(|e: String| {
        tracing::warn!("Rejected sync trigger: {}", sanitize_for_log(&e));
        AppError::BadRequest(e)
    })?;

    let report = state.scheduler.trigger_sync_now(direction).await;
    Ok(Json(report))
}

/// GET /api/erp-sync/rules
pub async fn get_rules(State(state): State<AppState>) -> Json<RulesResponse> {
    let rule_set = state.engine.rules();

    let rules = rule_set
        .rules
        .iter()
        .map(|rule| RuleView {
            name: rule.name.clone(),
            kind: rule.kind.type_name().to_string(),
            priority: rule.priority,
            description: rule.description.clone(),
        })
        .collect();

    Json(RulesResponse {
        source: rule_set.source,
        rules,
        pending_match_counts: state.engine.pending_match_counts(),
    })
}

/// POST /api/erp-sync/rules/reload
pub async fn reload_rules(State(state): State<AppState>) -> Json<ReloadResponse> {
    let source = state.engine.reload_rules().await;
    let rule_count = state.engine.rules().rules.len();

    tracing::info!(?source, rule_count, "Sync rules reloaded on request");
    Json(ReloadResponse { source, rule_count })
}
