// Persistence boundary for the sync engine

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::models::{CustomerRecord, FieldChange, PushStateUpdate, SyncLogEntry, SyncRuleRecord};
use crate::services::erp::error::Result;

use super::customer_repo::CustomerRepository;
use super::sync_audit_repo::SyncAuditRepository;
use super::sync_checkpoint_repo::SyncCheckpointRepository;
use super::sync_rule_repo::SyncRuleRepository;

#[async_trait]
pub trait SyncStore: Send + Sync {
    async fn find_customer_by_id(&self, id: i64) -> Result<Option<CustomerRecord>>;
    async fn find_customer_by_erp_id(&self, erp_id: i64) -> Result<Option<CustomerRecord>>;
    async fn find_customer_by_phone(&self, phone: &str) -> Result<Option<CustomerRecord>>;

    /// Insert a new customer and return its id. `record.id` is ignored.
    async fn insert_customer(&self, record: &CustomerRecord) -> Result<i64>;
    /// Write the business fields and ERP snapshot columns a pull owns. Push
    /// state, engagement metrics, business flags and verification flags are
    /// left untouched.
    async fn update_customer(&self, record: &CustomerRecord) -> Result<()>;
    /// Write the outcome of a push attempt and nothing else.
    async fn update_push_state(&self, update: &PushStateUpdate) -> Result<()>;

    /// Push-eligible customers (pending or failed, not invalid), business
    /// commitments first, then by data quality.
    async fn push_candidates(&self, limit: u32) -> Result<Vec<CustomerRecord>>;

    async fn append_field_changes(&self, changes: &[FieldChange]) -> Result<()>;
    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()>;

    async fn load_sync_rules(&self) -> Result<Vec<SyncRuleRecord>>;
    async fn increment_rule_matches(&self, counts: &[(String, i64)]) -> Result<()>;

    async fn get_checkpoint(&self, key: &str) -> Result<Option<DateTime<Utc>>>;
    async fn set_checkpoint(&self, key: &str, value: DateTime<Utc>) -> Result<()>;
}

/// PostgreSQL-backed store composed of the per-table repositories.
pub struct PgSyncStore {
    customers: CustomerRepository,
    audit: SyncAuditRepository,
    rules: SyncRuleRepository,
    checkpoints: SyncCheckpointRepository,
}

impl PgSyncStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            customers: CustomerRepository::new(pool.clone()),
            audit: SyncAuditRepository::new(pool.clone()),
            rules: SyncRuleRepository::new(pool.clone()),
            checkpoints: SyncCheckpointRepository::new(pool),
        }
    }
}

#[async_trait]
impl SyncStore for PgSyncStore {
    async fn find_customer_by_id(&self, id: i64) -> Result<Option<CustomerRecord>> {
        self.customers.find_by_id(id).await
    }

    async fn find_customer_by_erp_id(&self, erp_id: i64) -> Result<Option<CustomerRecord>> {
        self.customers.find_by_erp_id(erp_id).await
    }

    async fn find_customer_by_phone(&self, phone: &str) -> Result<Option<CustomerRecord>> {
        self.customers.find_by_phone(phone).await
    }

    async fn insert_customer(&self, record: &CustomerRecord) -> Result<i64> {
        self.customers.insert(record).await
    }

    async fn update_customer(&self, record: &CustomerRecord) -> Result<()> {
        self.customers.update(record).await
    }

    async fn update_push_state(&self, update: &PushStateUpdate) -> Result<()> {
        self.customers.update_push_state(update).await
    }

    async fn push_candidates(&self, limit: u32) -> Result<Vec<CustomerRecord>> {
        self.customers.push_candidates(limit).await
    }

    async fn append_field_changes(&self, changes: &[FieldChange]) -> Result<()> {
        self.audit.insert_field_changes(changes).await
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        self.audit.insert_sync_log(entry).await
    }

    async fn load_sync_rules(&self) -> Result<Vec<SyncRuleRecord>> {
        self.rules.load_active().await
    }

    async fn increment_rule_matches(&self, counts: &[(String, i64)]) -> Result<()> {
        self.rules.increment_match_counts(counts).await
    }

    async fn get_checkpoint(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        self.checkpoints.get(key).await
    }

    async fn set_checkpoint(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.checkpoints.set(key, value).await
    }
}
