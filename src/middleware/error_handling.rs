// ============================================================================
// Error Handling - HTTP Error Responses
// ============================================================================
//
// Internal errors (database, ERP transport) are logged server-side with full
// detail. Clients receive a generic message and the status code only.
//
// ============================================================================

use axum::{
    extract::rejection::JsonRejection,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use validator::ValidationErrors;

use crate::services::erp::SyncError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationErrors),

    #[error("JSON error: {0}")]
    Json(#[from] JsonRejection),

    #[error("Sync error: {0}")]
    Sync(#[from] SyncError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            AppError::Database(err) => {
                tracing::error!("Database error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            AppError::Validation(_) => (StatusCode::BAD_REQUEST, "Validation failed".to_string()),
            AppError::Json(_) => (StatusCode::BAD_REQUEST, "Invalid JSON".to_string()),
            AppError::Sync(SyncError::AlreadyRunning(direction)) => (
                StatusCode::CONFLICT,
                format!("A {} sync is already running", direction.job_name()),
            ),
            AppError::Sync(SyncError::InvalidConfig(msg)) => (StatusCode::BAD_REQUEST, msg),
            AppError::Sync(err) => {
                tracing::error!("Sync error: {:?}", err);
                (StatusCode::BAD_GATEWAY, "ERP synchronization failed".to_string())
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            AppError::Internal(err) => {
                tracing::error!("Internal error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = Json(json!({
            "error": error_message,
            "status": status.as_u16()
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
