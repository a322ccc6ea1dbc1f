use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use super::customer::{SyncAction, SyncStatus};

pub const CHECKPOINT_LAST_PULL: &str = "last_pull_time";
pub const CHECKPOINT_LAST_PUSH: &str = "last_push_time";

/// Direction of a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    ErpToLocal,
    LocalToErp,
}

impl SyncDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncDirection::ErpToLocal => "erp_to_local",
            SyncDirection::LocalToErp => "local_to_erp",
        }
    }

    /// Short label used in metrics and job names.
    pub fn job_name(&self) -> &'static str {
        match self {
            SyncDirection::ErpToLocal => "pull",
            SyncDirection::LocalToErp => "push",
        }
    }
}

impl fmt::Display for SyncDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Audit Rows
// ============================================================================

/// One applied field change. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FieldChange {
    pub customer_id: i64,
    pub field_name: String,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub source: String,
    pub change_type: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
}

/// One executed push/pull decision. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncLogEntry {
    pub customer_id: i64,
    pub direction: SyncDirection,
    pub sync_type: String,
    pub action: Option<SyncAction>,
    pub result: String,
    pub matched_rule: Option<String>,
    pub confidence: Option<f64>,
    pub reason: Option<String>,
    pub erp_customer_id: Option<i64>,
    pub changed_fields: Vec<String>,
    pub field_count: i32,
    pub created_at: DateTime<Utc>,
}

impl SyncLogEntry {
    pub fn new(customer_id: i64, direction: SyncDirection, sync_type: &str, result: &str) -> Self {
        Self {
            customer_id,
            direction,
            sync_type: sync_type.to_string(),
            action: None,
            result: result.to_string(),
            matched_rule: None,
            confidence: None,
            reason: None,
            erp_customer_id: None,
            changed_fields: Vec::new(),
            field_count: 0,
            created_at: Utc::now(),
        }
    }

    pub fn with_fields(mut self, fields: Vec<String>) -> Self {
        self.field_count = fields.len() as i32;
        self.changed_fields = fields;
        self
    }
}

/// A stored sync rule row, before validation into a `RuleKind`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncRuleRecord {
    pub id: i64,
    pub name: String,
    pub rule_type: String,
    pub priority: i32,
    pub conditions: serde_json::Value,
    pub action: Option<String>,
    pub description: Option<String>,
    pub match_count: i64,
    pub is_active: bool,
}

/// The columns a push run owns. Business fields are never written by a push,
/// so a pull running at the same time keeps what it applied.
#[derive(Debug, Clone, PartialEq)]
pub struct PushStateUpdate {
    pub customer_id: i64,
    /// Only written when the row has no ERP id yet.
    pub erp_customer_id: Option<i64>,
    pub status: SyncStatus,
    pub action: Option<SyncAction>,
    pub rule: Option<String>,
    pub confidence: Option<f64>,
    pub error: Option<String>,
    /// Kept as-is when `None`.
    pub pushed_at: Option<DateTime<Utc>>,
    /// ERP values just confirmed by the push, merged into `erp_known_values`.
    pub sent_values: BTreeMap<String, String>,
}

// ============================================================================
// Run Statistics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncItemError {
    pub customer_id: Option<i64>,
    pub erp_customer_id: Option<String>,
    pub error_message: String,
    pub error_type: String,
}

/// Counters for a single pull or push run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SyncStats {
    pub direction: SyncDirection,
    pub total: u32,
    pub created: u32,
    pub updated: u32,
    pub skipped: u32,
    pub failed: u32,
    /// Set when pagination stopped early; the checkpoint was not advanced.
    pub partial: bool,
    pub errors: Vec<SyncItemError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    pub fn new(direction: SyncDirection) -> Self {
        Self {
            direction,
            total: 0,
            created: 0,
            updated: 0,
            skipped: 0,
            failed: 0,
            partial: false,
            errors: Vec::new(),
            started_at: Utc::now(),
            finished_at: None,
        }
    }

    pub fn record_error(
        &mut self,
        customer_id: Option<i64>,
        erp_customer_id: Option<String>,
        error_type: &str,
        message: impl Into<String>,
    ) {
        self.failed += 1;
        self.errors.push(SyncItemError {
            customer_id,
            erp_customer_id,
            error_message: message.into(),
            error_type: error_type.to_string(),
        });
    }

    pub fn finish(&mut self) {
        self.finished_at = Some(Utc::now());
    }

    pub fn duration_secs(&self) -> f64 {
        let end = self.finished_at.unwrap_or_else(Utc::now);
        (end - self.started_at).num_milliseconds().max(0) as f64 / 1000.0
    }
}

/// Fields payload sent to the ERP, keyed by ERP field name.
pub type ErpPayload = BTreeMap<String, String>;
