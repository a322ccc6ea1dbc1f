// ERP Client Abstraction
// The sync engine talks to the ERP only through this trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use thiserror::Error;

use crate::models::{ErpCustomer, ErpPayload};

#[derive(Error, Debug)]
pub enum ErpClientError {
    #[error("ERP HTTP error ({0}): {1}")]
    Http(StatusCode, String),

    #[error("ERP API error (status {status}): {message}")]
    Api { status: i64, message: String },

    #[error("ERP login failed: {0}")]
    Login(String),

    #[error("ERP session expired")]
    SessionExpired,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid ERP configuration: {0}")]
    Config(String),

    #[error("Unexpected ERP response: {0}")]
    UnexpectedResponse(String),
}

pub type Result<T> = std::result::Result<T, ErpClientError>;

#[async_trait]
pub trait ErpClient: Send + Sync {
    /// One page of customers, optionally restricted to those updated after a
    /// point in time. Pages start at 1.
    async fn get_customers(
        &self,
        updated_after: Option<DateTime<Utc>>,
        page_size: u32,
        page_index: u32,
    ) -> Result<Vec<ErpCustomer>>;

    /// Create a customer. `Ok(None)` means the ERP refused without an error.
    async fn create_customer(&self, payload: &ErpPayload) -> Result<Option<i64>>;

    /// Update the given fields of an existing customer.
    async fn update_customer(&self, erp_id: i64, fields: &ErpPayload) -> Result<bool>;
}
