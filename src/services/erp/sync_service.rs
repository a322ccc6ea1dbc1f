// Unified Customer Sync Service
// Drives full pull (ERP -> local) and push (local -> ERP) runs.
//
// Record-level failures are counted and never stop a run. Only a failure
// before the first record (checkpoint read, candidate query, first page) aborts.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::SyncOptions;
use crate::middleware::metrics::{record_sync_run, record_sync_run_result};
use crate::models::{
    CustomerField, CustomerRecord, ErpCustomer, ErpPayload, PushStateUpdate, SyncAction, SyncDirection,
    SyncLogEntry, SyncStats, SyncStatus, ValueSource, CHECKPOINT_LAST_PULL, CHECKPOINT_LAST_PUSH,
};
use crate::repositories::SyncStore;
use crate::utils::{mask_option_phone, sanitize_for_log, sanitize_option_for_log};

use super::change_detector::{ChangeAction, ChangeDetector};
use super::erp_client::{ErpClient, ErpClientError};
use super::error::{Result, SyncError};
use super::rule_engine::{quality_score, RuleDecision, SyncRuleEngine};

/// Upper bound on pages fetched by one pull run.
pub const MAX_PULL_PAGES: u32 = 1000;

/// Fields whose ERP value is tracked in `erp_known_values` and pushed on UPDATE.
const PUSHABLE_FIELDS: [CustomerField; 3] = [CustomerField::Phone, CustomerField::Email, CustomerField::Address];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordOutcome {
    Created,
    Updated,
    Skipped,
}

impl RecordOutcome {
    fn count(self, stats: &mut SyncStats) {
        match self {
            RecordOutcome::Created => stats.created += 1,
            RecordOutcome::Updated => stats.updated += 1,
            RecordOutcome::Skipped => stats.skipped += 1,
        }
    }
}

pub struct UnifiedSyncService {
    erp: Arc<dyn ErpClient>,
    store: Arc<dyn SyncStore>,
    detector: Arc<ChangeDetector>,
    rules: Arc<SyncRuleEngine>,
    options: SyncOptions,
    pull_lock: Mutex<()>,
    push_lock: Mutex<()>,
}

impl UnifiedSyncService {
    pub fn new(
        erp: Arc<dyn ErpClient>,
        store: Arc<dyn SyncStore>,
        detector: Arc<ChangeDetector>,
        rules: Arc<SyncRuleEngine>,
        options: SyncOptions,
    ) -> Self {
        Self {
            erp,
            store,
            detector,
            rules,
            options,
            pull_lock: Mutex::new(()),
            push_lock: Mutex::new(()),
        }
    }

    pub fn rule_engine(&self) -> &Arc<SyncRuleEngine> {
        &self.rules
    }

    pub fn is_running(&self, direction: SyncDirection) -> bool {
        let lock = match direction {
            SyncDirection::ErpToLocal => &self.pull_lock,
            SyncDirection::LocalToErp => &self.push_lock,
        };
        lock.try_lock().is_err()
    }

    // ========================================================================
    // Pull: ERP -> local
    // ========================================================================

    /// Pull customers from the ERP. Rejected with `AlreadyRunning` while
    /// another pull is in progress.
    pub async fn sync_from_erp(&self, incremental: bool) -> Result<SyncStats> {
        let Ok(_guard) = self.pull_lock.try_lock() else {
            record_sync_run_result("pull", "already_running");
            return Err(SyncError::AlreadyRunning(SyncDirection::ErpToLocal));
        };

        let result = self.run_pull(incremental).await;
        match &result {
            Ok(stats) => record_sync_run(stats),
            Err(_) => record_sync_run_result("pull", "failed"),
        }
        result
    }

    async fn run_pull(&self, incremental: bool) -> Result<SyncStats> {
        let run_id = Uuid::new_v4();
        let mut stats = SyncStats::new(SyncDirection::ErpToLocal);

        let updated_after = if incremental {
            self.store.get_checkpoint(CHECKPOINT_LAST_PULL).await?
        } else {
            None
        };

        tracing::info!(
            %run_id,
            incremental,
            updated_after = ?updated_after,
            "Starting ERP pull"
        );

        let page_size = self.options.pull_page_size.max(1);
        let mut page_index = 1;

        loop {
            if page_index > MAX_PULL_PAGES {
                tracing::warn!(%run_id, "Pull stopped after {} pages", MAX_PULL_PAGES);
                stats.partial = true;
                break;
            }

            let page = match self.erp.get_customers(updated_after, page_size, page_index).await {
                Ok(page) => page,
                Err(e) if page_index == 1 => {
                    tracing::error!(%run_id, "ERP pull aborted, first page failed: {}", e);
                    return Err(e.into());
                }
                Err(e) => {
                    tracing::warn!(
                        %run_id,
                        "ERP pull stopped at page {}, checkpoint left unchanged: {}",
                        page_index,
                        e
                    );
                    stats.partial = true;
                    break;
                }
            };

            if page.is_empty() {
                break;
            }

            tracing::debug!(%run_id, "Page {} returned {} customers", page_index, page.len());

            for erp_customer in &page {
                stats.total += 1;
                match self.pull_one(erp_customer).await {
                    Ok(outcome) => outcome.count(&mut stats),
                    Err(e) => {
                        tracing::error!(
                            %run_id,
                            erp_id = %sanitize_option_for_log(&erp_customer.ord),
                            "Failed to pull customer: {}",
                            e
                        );
                        stats.record_error(None, erp_customer.ord.clone(), e.error_type(), e.to_string());
                    }
                }
            }

            if page.len() < page_size as usize {
                break;
            }
            page_index += 1;
        }

        if !stats.partial {
            if let Err(e) = self.store.set_checkpoint(CHECKPOINT_LAST_PULL, stats.started_at).await {
                tracing::error!(%run_id, "Failed to advance pull checkpoint: {}", e);
                stats.partial = true;
            }
        }

        stats.finish();
        tracing::info!(
            %run_id,
            total = stats.total,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            failed = stats.failed,
            partial = stats.partial,
            duration_secs = stats.duration_secs(),
            "ERP pull finished"
        );

        Ok(stats)
    }

    async fn pull_one(&self, erp_customer: &ErpCustomer) -> Result<RecordOutcome> {
        let mut local = match erp_customer.erp_id() {
            Some(erp_id) => self.store.find_customer_by_erp_id(erp_id).await?,
            None => None,
        };

        if local.is_none() {
            if let Some(phone) = erp_customer.field_value(CustomerField::Phone) {
                local = self.store.find_customer_by_phone(&phone).await?;
            }
        }

        match local {
            Some(record) => self.merge_from_erp(record, erp_customer).await,
            None => self.create_from_erp(erp_customer).await,
        }
    }

    async fn create_from_erp(&self, erp_customer: &ErpCustomer) -> Result<RecordOutcome> {
        let erp_id = erp_customer.erp_id().ok_or_else(|| {
            SyncError::DataIntegrity(format!(
                "ERP customer has no usable id (ord = {})",
                sanitize_option_for_log(&erp_customer.ord)
            ))
        })?;

        let now = Utc::now();
        let mut record = CustomerRecord {
            erp_customer_id: Some(erp_id),
            erp_customer_type: erp_customer.customer_type(),
            erp_sync_status: SyncStatus::Synced,
            erp_last_pulled_at: Some(now),
            erp_updated_at: Some(now),
            ..Default::default()
        };

        for field in CustomerField::ALL {
            if field == CustomerField::ErpCustomerId {
                continue;
            }
            if let Some(value) = erp_customer.field_value(field) {
                record.set_field(field, Some(value), ValueSource::Erp);
            }
        }
        refresh_known_values(&mut record, erp_customer);
        record.data_quality_score = quality_score(&record);

        let customer_id = self.store.insert_customer(&record).await?;

        let fields: Vec<String> = CustomerField::ALL
            .into_iter()
            .filter(|f| record.field_value(*f).is_some())
            .map(|f| f.local_name().to_string())
            .collect();
        let mut entry = SyncLogEntry::new(customer_id, SyncDirection::ErpToLocal, "pull", "success")
            .with_fields(fields);
        entry.action = Some(SyncAction::Create);
        entry.erp_customer_id = Some(erp_id);
        self.audit(entry).await;

        tracing::info!(
            customer_id,
            erp_id,
            name = %sanitize_option_for_log(&record.display_name()),
            phone = %mask_option_phone(&record.phone),
            "Created local customer from ERP"
        );

        Ok(RecordOutcome::Created)
    }

    async fn merge_from_erp(&self, record: CustomerRecord, erp_customer: &ErpCustomer) -> Result<RecordOutcome> {
        let change_set = self.detector.detect_changes(erp_customer, &record);
        let to_pull = self.detector.get_fields_to_pull(&change_set.changes);

        let mut updated = record.clone();

        for (field, value) in &to_pull {
            if *field == CustomerField::ErpCustomerId {
                let new_id = erp_customer.erp_id().ok_or_else(|| {
                    SyncError::DataIntegrity(format!("malformed ERP id '{}'", sanitize_for_log(value)))
                })?;
                self.ensure_erp_id_assignable(&record, new_id).await?;
                updated.erp_customer_id = Some(new_id);
            } else {
                updated.set_field(*field, Some(value.clone()), ValueSource::Erp);
            }
        }

        let now = Utc::now();
        refresh_known_values(&mut updated, erp_customer);
        updated.erp_last_pulled_at = Some(now);
        if !to_pull.is_empty() {
            updated.erp_updated_at = Some(now);
            updated.data_quality_score = quality_score(&updated);
        }

        let unresolved = change_set.count(ChangeAction::Merge) + change_set.count(ChangeAction::TakeLocal);
        if unresolved > 0 {
            tracing::debug!(
                customer_id = record.id,
                "{} field(s) left for push or manual merge",
                unresolved
            );
        }

        self.store.update_customer(&updated).await?;

        if to_pull.is_empty() {
            return Ok(RecordOutcome::Skipped);
        }

        let applied: Vec<_> = change_set
            .changes
            .iter()
            .filter(|c| c.action == ChangeAction::TakeErp)
            .cloned()
            .collect();
        if let Err(e) = self
            .detector
            .log_changes(self.store.as_ref(), record.id, &applied, SyncDirection::ErpToLocal)
            .await
        {
            tracing::warn!(customer_id = record.id, "Failed to record field changes: {}", e);
        }

        let fields = to_pull.keys().map(|f| f.local_name().to_string()).collect();
        let mut entry = SyncLogEntry::new(record.id, SyncDirection::ErpToLocal, "pull", "success").with_fields(fields);
        entry.action = Some(SyncAction::Update);
        entry.erp_customer_id = updated.erp_customer_id;
        self.audit(entry).await;

        tracing::debug!(customer_id = record.id, fields = to_pull.len(), "Updated local customer from ERP");
        Ok(RecordOutcome::Updated)
    }

    /// An ERP id may only be written to a record that has none, and only if
    /// no other record owns it.
    async fn ensure_erp_id_assignable(&self, record: &CustomerRecord, erp_id: i64) -> Result<()> {
        if let Some(existing) = record.erp_customer_id {
            if existing != erp_id {
                return Err(SyncError::DataIntegrity(format!(
                    "customer {} is linked to ERP id {}, refusing to relink to {}",
                    record.id, existing, erp_id
                )));
            }
        }

        if let Some(owner) = self.store.find_customer_by_erp_id(erp_id).await? {
            if owner.id != record.id {
                return Err(SyncError::DataIntegrity(format!(
                    "ERP id {} already belongs to customer {}",
                    erp_id, owner.id
                )));
            }
        }

        Ok(())
    }

    // ========================================================================
    // Push: local -> ERP
    // ========================================================================

    /// Push up to `batch_size` eligible customers. Rejected with
    /// `AlreadyRunning` while another push is in progress.
    pub async fn sync_to_erp(&self, batch_size: u32) -> Result<SyncStats> {
        let Ok(_guard) = self.push_lock.try_lock() else {
            record_sync_run_result("push", "already_running");
            return Err(SyncError::AlreadyRunning(SyncDirection::LocalToErp));
        };

        let result = self.run_push(batch_size).await;
        match &result {
            Ok(stats) => record_sync_run(stats),
            Err(_) => record_sync_run_result("push", "failed"),
        }
        result
    }

    async fn run_push(&self, batch_size: u32) -> Result<SyncStats> {
        let run_id = Uuid::new_v4();
        let mut stats = SyncStats::new(SyncDirection::LocalToErp);

        let rule_source = self.rules.reload_rules().await;
        let candidates = self.store.push_candidates(batch_size).await?;

        tracing::info!(
            %run_id,
            candidates = candidates.len(),
            rules = ?rule_source,
            "Starting ERP push"
        );

        for candidate in candidates {
            stats.total += 1;
            let customer_id = candidate.id;

            match self.push_one(candidate).await {
                Ok(outcome) => outcome.count(&mut stats),
                Err(e) => {
                    tracing::error!(%run_id, customer_id, "Failed to push customer: {}", e);
                    stats.record_error(Some(customer_id), None, e.error_type(), e.to_string());
                }
            }
        }

        self.rules.flush_match_counts().await;

        if let Err(e) = self.store.set_checkpoint(CHECKPOINT_LAST_PUSH, stats.started_at).await {
            tracing::warn!(%run_id, "Failed to record push checkpoint: {}", e);
        }

        stats.finish();
        tracing::info!(
            %run_id,
            total = stats.total,
            created = stats.created,
            updated = stats.updated,
            skipped = stats.skipped,
            failed = stats.failed,
            duration_secs = stats.duration_secs(),
            "ERP push finished"
        );

        Ok(stats)
    }

    async fn push_one(&self, mut customer: CustomerRecord) -> Result<RecordOutcome> {
        customer.data_quality_score = quality_score(&customer);

        let decision = self.rules.evaluate(&customer);
        customer.erp_sync_action = Some(decision.action);
        customer.erp_sync_rule = Some(decision.matched_rule.clone());
        customer.erp_sync_confidence = Some(decision.confidence);

        tracing::debug!(
            customer_id = customer.id,
            action = %decision.action,
            rule = %decision.matched_rule,
            confidence = decision.confidence,
            "Push decision"
        );

        let result = match decision.action {
            SyncAction::Skip => self.skip_customer(&mut customer, &decision).await,
            SyncAction::Create if customer.erp_customer_id.is_none() => {
                self.create_in_erp(&mut customer, &decision).await
            }
            SyncAction::Create | SyncAction::Update => self.update_in_erp(&mut customer, &decision).await,
        };

        if let Err(e) = &result {
            self.mark_failed(&mut customer, &decision, e).await;
        }
        result
    }

    async fn create_in_erp(&self, customer: &mut CustomerRecord, decision: &RuleDecision) -> Result<RecordOutcome> {
        let payload = self.build_create_payload(customer);

        let erp_id = self.erp.create_customer(&payload).await?.ok_or_else(|| {
            SyncError::Erp(ErpClientError::UnexpectedResponse(
                "ERP did not return a customer id".to_string(),
            ))
        })?;

        self.ensure_erp_id_assignable(customer, erp_id).await.map_err(|e| {
            SyncError::DataIntegrity(format!(
                "ERP customer {} created but cannot be linked locally: {}",
                erp_id, e
            ))
        })?;

        customer.erp_customer_id = Some(erp_id);
        let sent = self.mark_pushed(customer, &payload);
        self.store.update_push_state(&push_state(customer, sent)).await.map_err(|e| {
            SyncError::CollaboratorUnavailable(format!(
                "ERP customer {} created but local write failed: {}",
                erp_id, e
            ))
        })?;

        let mut entry = self.push_entry(customer, decision, "create", "success");
        entry = entry.with_fields(payload.keys().cloned().collect());
        self.audit(entry).await;

        tracing::info!(
            customer_id = customer.id,
            erp_id,
            name = %sanitize_option_for_log(&customer.display_name()),
            "Created ERP customer"
        );
        Ok(RecordOutcome::Created)
    }

    async fn update_in_erp(&self, customer: &mut CustomerRecord, decision: &RuleDecision) -> Result<RecordOutcome> {
        let erp_id = customer.erp_customer_id.ok_or_else(|| {
            SyncError::DataIntegrity(format!("customer {} has no ERP id to update", customer.id))
        })?;

        let fields = changed_push_fields(customer);

        if fields.is_empty() {
            customer.erp_sync_status = SyncStatus::Synced;
            customer.erp_sync_error = None;
            self.store.update_push_state(&push_state(customer, ErpPayload::new())).await?;
            self.audit(self.push_entry(customer, decision, "update", "no_changes")).await;
            return Ok(RecordOutcome::Skipped);
        }

        if !self.erp.update_customer(erp_id, &fields).await? {
            return Err(SyncError::Erp(ErpClientError::UnexpectedResponse(format!(
                "ERP rejected update of customer {}",
                erp_id
            ))));
        }

        let sent = self.mark_pushed(customer, &fields);
        self.store.update_push_state(&push_state(customer, sent)).await?;

        let entry = self
            .push_entry(customer, decision, "update", "success")
            .with_fields(fields.keys().cloned().collect());
        self.audit(entry).await;

        tracing::info!(customer_id = customer.id, erp_id, fields = fields.len(), "Updated ERP customer");
        Ok(RecordOutcome::Updated)
    }

    async fn skip_customer(&self, customer: &mut CustomerRecord, decision: &RuleDecision) -> Result<RecordOutcome> {
        customer.erp_sync_status = SyncStatus::Skipped;
        customer.erp_sync_error = Some(decision.reason.clone());
        self.store.update_push_state(&push_state(customer, ErpPayload::new())).await?;

        self.audit(self.push_entry(customer, decision, "skip", "skipped")).await;
        Ok(RecordOutcome::Skipped)
    }

    async fn mark_failed(&self, customer: &mut CustomerRecord, decision: &RuleDecision, error: &SyncError) {
        customer.erp_sync_status = SyncStatus::Failed;
        customer.erp_sync_error = Some(error.to_string());

        if let Err(e) = self.store.update_push_state(&push_state(customer, ErpPayload::new())).await {
            tracing::error!(customer_id = customer.id, "Failed to mark customer as failed: {}", e);
        }

        let sync_type = decision.action.as_str().to_ascii_lowercase();
        let mut entry = self.push_entry(customer, decision, &sync_type, "failed");
        entry.reason = Some(error.to_string());
        self.audit(entry).await;
    }

    /// Marks the record synced and returns the pushable values the ERP now holds.
    fn mark_pushed(&self, customer: &mut CustomerRecord, sent: &ErpPayload) -> ErpPayload {
        let mut confirmed = ErpPayload::new();
        for field in PUSHABLE_FIELDS {
            if let Some(value) = sent.get(field.erp_name()) {
                confirmed.insert(field.erp_name().to_string(), value.clone());
            }
        }
        customer
            .erp_known_values
            .extend(confirmed.iter().map(|(k, v)| (k.clone(), v.clone())));
        customer.erp_sync_status = SyncStatus::Synced;
        customer.erp_sync_error = None;
        customer.erp_last_pushed_at = Some(Utc::now());
        confirmed
    }

    /// Payload for a new ERP customer. Absent values are omitted.
    pub fn build_create_payload(&self, customer: &CustomerRecord) -> ErpPayload {
        let mut payload = ErpPayload::new();
        let mut put = |key: &str, value: Option<String>| {
            if let Some(value) = value {
                payload.insert(key.to_string(), value);
            }
        };

        put("intsort", Some(customer.erp_customer_type.to_string()));
        put("name", customer.display_name());
        put(
            "person_name",
            customer
                .field_value(CustomerField::RealName)
                .or_else(|| crate::models::normalize_value(customer.wechat_nickname.as_deref())),
        );
        put("mobile", customer.field_value(CustomerField::Phone));
        put("email", customer.field_value(CustomerField::Email));
        put("weixinAcc", customer.field_value(CustomerField::WechatId));
        put("address", customer.field_value(CustomerField::Address));
        put("sort1", Some(self.options.default_follow_level.clone()));
        put("ly", Some(self.options.customer_source_id.clone()));
        put(
            "intro",
            Some(format!(
                "Added from the customer service platform at {}",
                Utc::now().format("%Y-%m-%d %H:%M:%S")
            )),
        );

        payload
    }

    fn push_entry(&self, customer: &CustomerRecord, decision: &RuleDecision, sync_type: &str, result: &str) -> SyncLogEntry {
        let mut entry = SyncLogEntry::new(customer.id, SyncDirection::LocalToErp, sync_type, result);
        entry.action = Some(decision.action);
        entry.matched_rule = Some(decision.matched_rule.clone());
        entry.confidence = Some(decision.confidence);
        entry.reason = Some(decision.reason.clone());
        entry.erp_customer_id = customer.erp_customer_id;
        entry
    }

    /// Append to the sync log. Audit failures are logged and never fail a record.
    async fn audit(&self, entry: SyncLogEntry) {
        if let Err(e) = self.store.append_sync_log(&entry).await {
            tracing::warn!(customer_id = entry.customer_id, "Failed to append sync log: {}", e);
        }
    }
}

/// Pushable fields whose local value differs from the value last confirmed in the ERP.
pub fn changed_push_fields(customer: &CustomerRecord) -> ErpPayload {
    PUSHABLE_FIELDS
        .into_iter()
        .filter_map(|field| {
            let value = customer.field_value(field)?;
            let erp_name = field.erp_name();
            (customer.erp_known_values.get(erp_name) != Some(&value)).then(|| (erp_name.to_string(), value))
        })
        .collect()
}

/// The push-owned columns of `customer`, plus the ERP values the push confirmed.
fn push_state(customer: &CustomerRecord, sent_values: ErpPayload) -> PushStateUpdate {
    PushStateUpdate {
        customer_id: customer.id,
        erp_customer_id: customer.erp_customer_id,
        status: customer.erp_sync_status,
        action: customer.erp_sync_action,
        rule: customer.erp_sync_rule.clone(),
        confidence: customer.erp_sync_confidence,
        error: customer.erp_sync_error.clone(),
        pushed_at: customer.erp_last_pushed_at,
        sent_values,
    }
}

fn refresh_known_values(record: &mut CustomerRecord, erp_customer: &ErpCustomer) {
    for field in PUSHABLE_FIELDS {
        match erp_customer.field_value(field) {
            Some(value) => {
                record.erp_known_values.insert(field.erp_name().to_string(), value);
            }
            None => {
                record.erp_known_values.remove(field.erp_name());
            }
        }
    }
}
