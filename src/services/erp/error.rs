// ERP Sync Error Types

use thiserror::Error;

use crate::models::SyncDirection;
use super::erp_client::ErpClientError;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error("ERP error: {0}")]
    Erp(#[from] ErpClientError),

    #[error("Rule load error: {0}")]
    RuleLoad(String),

    #[error("Data integrity error: {0}")]
    DataIntegrity(String),

    #[error("A {0} sync is already running")]
    AlreadyRunning(SyncDirection),

    #[error("Scheduler job error: {0}")]
    SchedulerJob(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl SyncError {
    /// Short machine-readable tag used in run statistics and metrics.
    pub fn error_type(&self) -> &'static str {
        match self {
            SyncError::Database(_) => "database",
            SyncError::CollaboratorUnavailable(_) => "collaborator_unavailable",
            SyncError::Erp(_) => "erp",
            SyncError::RuleLoad(_) => "rule_load",
            SyncError::DataIntegrity(_) => "data_integrity",
            SyncError::AlreadyRunning(_) => "already_running",
            SyncError::SchedulerJob(_) => "scheduler_job",
            SyncError::InvalidConfig(_) => "invalid_config",
        }
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
