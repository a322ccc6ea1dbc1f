// In-memory SyncStore
// Used by tests and dry runs. Mirrors the uniqueness and write-once guarantees
// of the PostgreSQL schema, and can be told to fail specific operations.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::models::{CustomerRecord, FieldChange, PushStateUpdate, SyncLogEntry, SyncRuleRecord};
use crate::services::erp::error::{Result, SyncError};

use super::sync_store::SyncStore;

#[derive(Debug, Default)]
struct InjectedFailures {
    push_candidates: bool,
    checkpoint_reads: bool,
    rule_loads: bool,
    rule_match_flush: bool,
    customer_updates: HashSet<i64>,
}

#[derive(Debug, Default)]
struct MemoryState {
    next_id: i64,
    customers: BTreeMap<i64, CustomerRecord>,
    field_changes: Vec<FieldChange>,
    sync_logs: Vec<SyncLogEntry>,
    rules: Vec<SyncRuleRecord>,
    checkpoints: HashMap<String, DateTime<Utc>>,
}

#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    state: Mutex<MemoryState>,
    failures: Mutex<InjectedFailures>,
}

fn injected(operation: &str) -> SyncError {
    SyncError::CollaboratorUnavailable(format!("injected failure: {}", operation))
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn with_rules(rules: Vec<SyncRuleRecord>) -> Self {
        let store = Self::new();
        store.set_rules(rules).await;
        store
    }

    // ========================================================================
    // Seeding & Inspection
    // ========================================================================

    /// Insert a customer as-is, bypassing engine checks. Returns the id.
    pub async fn seed_customer(&self, mut record: CustomerRecord) -> i64 {
        let mut state = self.state.lock().await;
        state.next_id += 1;
        record.id = state.next_id;
        let id = record.id;
        state.customers.insert(id, record);
        id
    }

    pub async fn set_rules(&self, rules: Vec<SyncRuleRecord>) {
        self.state.lock().await.rules = rules;
    }

    pub async fn customer(&self, id: i64) -> Option<CustomerRecord> {
        self.state.lock().await.customers.get(&id).cloned()
    }

    pub async fn customers(&self) -> Vec<CustomerRecord> {
        self.state.lock().await.customers.values().cloned().collect()
    }

    pub async fn field_changes(&self) -> Vec<FieldChange> {
        self.state.lock().await.field_changes.clone()
    }

    pub async fn sync_logs(&self) -> Vec<SyncLogEntry> {
        self.state.lock().await.sync_logs.clone()
    }

    pub async fn rules(&self) -> Vec<SyncRuleRecord> {
        self.state.lock().await.rules.clone()
    }

    pub async fn checkpoint(&self, key: &str) -> Option<DateTime<Utc>> {
        self.state.lock().await.checkpoints.get(key).copied()
    }

    // ========================================================================
    // Failure Injection
    // ========================================================================

    pub async fn fail_push_candidates(&self, fail: bool) {
        self.failures.lock().await.push_candidates = fail;
    }

    pub async fn fail_checkpoint_reads(&self, fail: bool) {
        self.failures.lock().await.checkpoint_reads = fail;
    }

    pub async fn fail_rule_loads(&self, fail: bool) {
        self.failures.lock().await.rule_loads = fail;
    }

    pub async fn fail_rule_match_flush(&self, fail: bool) {
        self.failures.lock().await.rule_match_flush = fail;
    }

    pub async fn fail_updates_for(&self, customer_id: i64) {
        self.failures.lock().await.customer_updates.insert(customer_id);
    }

    async fn check_update_allowed(&self, customer_id: i64) -> Result<()> {
        if self.failures.lock().await.customer_updates.contains(&customer_id) {
            return Err(injected("update_customer"));
        }
        Ok(())
    }

    /// The write-once and uniqueness rules of `erp_customer_id`.
    fn check_erp_id(state: &MemoryState, customer_id: i64, erp_id: Option<i64>) -> Result<()> {
        let existing = state
            .customers
            .get(&customer_id)
            .ok_or(SyncError::Database(sqlx::Error::RowNotFound))?
            .erp_customer_id;

        let Some(erp_id) = erp_id else {
            return Ok(());
        };
        if let Some(old) = existing {
            if old != erp_id {
                return Err(SyncError::DataIntegrity(format!(
                    "erp_customer_id {} cannot be reassigned",
                    old
                )));
            }
        }
        if let Some(owner) = Self::erp_id_owner(state, erp_id) {
            if owner != customer_id {
                return Err(SyncError::DataIntegrity(format!(
                    "erp_customer_id {} already belongs to customer {}",
                    erp_id, owner
                )));
            }
        }
        Ok(())
    }

    fn erp_id_owner(state: &MemoryState, erp_id: i64) -> Option<i64> {
        state
            .customers
            .values()
            .find(|c| c.erp_customer_id == Some(erp_id))
            .map(|c| c.id)
    }
}

#[async_trait]
impl SyncStore for InMemorySyncStore {
    async fn find_customer_by_id(&self, id: i64) -> Result<Option<CustomerRecord>> {
        Ok(self.state.lock().await.customers.get(&id).cloned())
    }

    async fn find_customer_by_erp_id(&self, erp_id: i64) -> Result<Option<CustomerRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .values()
            .find(|c| c.erp_customer_id == Some(erp_id))
            .cloned())
    }

    async fn find_customer_by_phone(&self, phone: &str) -> Result<Option<CustomerRecord>> {
        let state = self.state.lock().await;
        Ok(state
            .customers
            .values()
            .find(|c| c.phone.as_deref() == Some(phone))
            .cloned())
    }

    async fn insert_customer(&self, record: &CustomerRecord) -> Result<i64> {
        let mut state = self.state.lock().await;

        if let Some(erp_id) = record.erp_customer_id {
            if let Some(owner) = Self::erp_id_owner(&state, erp_id) {
                return Err(SyncError::DataIntegrity(format!(
                    "erp_customer_id {} already belongs to customer {}",
                    erp_id, owner
                )));
            }
        }

        state.next_id += 1;
        let id = state.next_id;
        let mut stored = record.clone();
        stored.id = id;
        state.customers.insert(id, stored);
        Ok(id)
    }

    async fn update_customer(&self, record: &CustomerRecord) -> Result<()> {
        self.check_update_allowed(record.id).await?;

        let mut state = self.state.lock().await;
        Self::check_erp_id(&state, record.id, record.erp_customer_id)?;
        let stored = state
            .customers
            .get_mut(&record.id)
            .ok_or(SyncError::Database(sqlx::Error::RowNotFound))?;

        // Same column list as the PostgreSQL UPDATE.
        stored.phone = record.phone.clone();
        stored.phone_source = record.phone_source;
        stored.company_name = record.company_name.clone();
        stored.company_name_source = record.company_name_source;
        stored.real_name = record.real_name.clone();
        stored.real_name_source = record.real_name_source;
        stored.email = record.email.clone();
        stored.email_source = record.email_source;
        stored.address = record.address.clone();
        stored.address_source = record.address_source;
        stored.wechat_id = record.wechat_id.clone();
        stored.erp_customer_id = stored.erp_customer_id.or(record.erp_customer_id);
        stored.erp_customer_code = record.erp_customer_code.clone();
        stored.erp_customer_type = record.erp_customer_type;
        stored.data_quality_score = record.data_quality_score;
        stored.erp_last_pulled_at = record.erp_last_pulled_at;
        stored.erp_updated_at = record.erp_updated_at;
        stored.erp_known_values = record.erp_known_values.clone();
        Ok(())
    }

    async fn update_push_state(&self, update: &PushStateUpdate) -> Result<()> {
        self.check_update_allowed(update.customer_id).await?;

        let mut state = self.state.lock().await;
        Self::check_erp_id(&state, update.customer_id, update.erp_customer_id)?;
        let stored = state
            .customers
            .get_mut(&update.customer_id)
            .ok_or(SyncError::Database(sqlx::Error::RowNotFound))?;

        stored.erp_customer_id = stored.erp_customer_id.or(update.erp_customer_id);
        stored.erp_sync_status = update.status;
        stored.erp_sync_action = update.action;
        stored.erp_sync_rule = update.rule.clone();
        stored.erp_sync_confidence = update.confidence;
        stored.erp_sync_error = update.error.clone();
        if update.pushed_at.is_some() {
            stored.erp_last_pushed_at = update.pushed_at;
        }
        stored
            .erp_known_values
            .extend(update.sent_values.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    async fn push_candidates(&self, limit: u32) -> Result<Vec<CustomerRecord>> {
        if self.failures.lock().await.push_candidates {
            return Err(injected("push_candidates"));
        }

        let state = self.state.lock().await;
        let mut candidates: Vec<CustomerRecord> = state
            .customers
            .values()
            .filter(|c| c.erp_sync_status.is_push_eligible() && !c.marked_as_invalid)
            .cloned()
            .collect();

        candidates.sort_by(|a, b| {
            b.has_business_commitment()
                .cmp(&a.has_business_commitment())
                .then_with(|| b.data_quality_score.total_cmp(&a.data_quality_score))
                .then_with(|| a.id.cmp(&b.id))
        });
        candidates.truncate(limit as usize);

        Ok(candidates)
    }

    async fn append_field_changes(&self, changes: &[FieldChange]) -> Result<()> {
        self.state.lock().await.field_changes.extend_from_slice(changes);
        Ok(())
    }

    async fn append_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        self.state.lock().await.sync_logs.push(entry.clone());
        Ok(())
    }

    async fn load_sync_rules(&self) -> Result<Vec<SyncRuleRecord>> {
        if self.failures.lock().await.rule_loads {
            return Err(injected("load_sync_rules"));
        }

        let state = self.state.lock().await;
        let mut rules: Vec<SyncRuleRecord> =
            state.rules.iter().filter(|r| r.is_active).cloned().collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn increment_rule_matches(&self, counts: &[(String, i64)]) -> Result<()> {
        if self.failures.lock().await.rule_match_flush {
            return Err(injected("increment_rule_matches"));
        }

        let mut state = self.state.lock().await;
        for (name, delta) in counts {
            if let Some(rule) = state.rules.iter_mut().find(|r| &r.name == name) {
                rule.match_count += delta;
            }
        }
        Ok(())
    }

    async fn get_checkpoint(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        if self.failures.lock().await.checkpoint_reads {
            return Err(injected("get_checkpoint"));
        }

        Ok(self.state.lock().await.checkpoints.get(key).copied())
    }

    async fn set_checkpoint(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        self.state
            .lock()
            .await
            .checkpoints
            .insert(key.to_string(), value);
        Ok(())
    }
}
