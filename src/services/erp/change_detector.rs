// Change Detector
// Field-level, provenance-aware diff between an ERP snapshot and a local customer.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::Utc;
use dashmap::DashSet;
use serde::{Deserialize, Serialize};

use crate::models::{CustomerField, CustomerRecord, ErpCustomer, ErpPayload, FieldChange, SyncDirection};
use crate::repositories::SyncStore;
use crate::services::erp::error::Result;

// ============================================================================
// Strategies & Actions
// ============================================================================

/// How a differing field picks its authoritative side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStrategy {
    ErpAlways,
    LocalAlways,
    ErpUnlessVerified,
    Latest,
}

impl SourceStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStrategy::ErpAlways => "erp_always",
            SourceStrategy::LocalAlways => "local_always",
            SourceStrategy::ErpUnlessVerified => "erp_unless_verified",
            SourceStrategy::Latest => "latest",
        }
    }

    fn default_for(field: CustomerField) -> Self {
        match field {
            CustomerField::ErpCustomerId | CustomerField::ErpCustomerCode => SourceStrategy::ErpAlways,
            CustomerField::Phone | CustomerField::CompanyName | CustomerField::RealName => {
                SourceStrategy::ErpUnlessVerified
            }
            CustomerField::WechatId => SourceStrategy::LocalAlways,
            CustomerField::Email | CustomerField::Address => SourceStrategy::Latest,
        }
    }
}

impl FromStr for SourceStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "erp_always" => Ok(SourceStrategy::ErpAlways),
            "local_always" => Ok(SourceStrategy::LocalAlways),
            "erp_unless_verified" => Ok(SourceStrategy::ErpUnlessVerified),
            "latest" => Ok(SourceStrategy::Latest),
            other => Err(format!("unknown source strategy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeAction {
    TakeErp,
    TakeLocal,
    /// Both sides hold a value and neither can be proven newer. Never applied automatically.
    Merge,
    Skip,
}

impl ChangeAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::TakeErp => "take_erp",
            ChangeAction::TakeLocal => "take_local",
            ChangeAction::Merge => "merge",
            ChangeAction::Skip => "skip",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One differing field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Change {
    pub field: CustomerField,
    pub erp_value: Option<String>,
    pub local_value: Option<String>,
    pub priority: u8,
    pub action: ChangeAction,
    pub reason: &'static str,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChangeSet {
    pub has_changes: bool,
    pub changes: Vec<Change>,
}

impl ChangeSet {
    /// Action decided for a field. Fields with equal values are not in the set
    /// and report `Skip`.
    pub fn action_for(&self, field: CustomerField) -> ChangeAction {
        self.changes
            .iter()
            .find(|c| c.field == field)
            .map(|c| c.action)
            .unwrap_or(ChangeAction::Skip)
    }

    pub fn count(&self, action: ChangeAction) -> usize {
        self.changes.iter().filter(|c| c.action == action).count()
    }
}

// ============================================================================
// Detector
// ============================================================================

pub struct ChangeDetector {
    strategies: HashMap<CustomerField, Option<SourceStrategy>>,
    warned_fields: DashSet<CustomerField>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeDetector {
    pub fn new() -> Self {
        let strategies = CustomerField::ALL
            .into_iter()
            .map(|field| (field, Some(SourceStrategy::default_for(field))))
            .collect();

        Self {
            strategies,
            warned_fields: DashSet::new(),
        }
    }

    /// Default table with per-field overrides keyed by local field name.
    ///
    /// Unknown field names are ignored. An unknown strategy name leaves the
    /// field without a strategy, so its differences are skipped.
    pub fn with_overrides(overrides: &HashMap<String, String>) -> Self {
        let mut detector = Self::new();

        for (field_name, strategy_name) in overrides {
            let Some(field) = CustomerField::from_local_name(field_name) else {
                tracing::warn!("Ignoring strategy override for unknown field '{}'", field_name);
                continue;
            };

            let strategy = match strategy_name.parse::<SourceStrategy>() {
                Ok(strategy) => Some(strategy),
                Err(e) => {
                    tracing::warn!("Field '{}' has no usable strategy: {}", field_name, e);
                    None
                }
            };
            detector.strategies.insert(field, strategy);
        }

        detector
    }

    pub fn strategy_for(&self, field: CustomerField) -> Option<SourceStrategy> {
        self.strategies.get(&field).copied().flatten()
    }

    /// Compare an ERP snapshot with a local record, field by field.
    pub fn detect_changes(&self, erp: &ErpCustomer, local: &CustomerRecord) -> ChangeSet {
        let mut changes: Vec<Change> = CustomerField::ALL
            .into_iter()
            .filter_map(|field| {
                let erp_value = erp.field_value(field);
                let local_value = local.field_value(field);

                if erp_value == local_value {
                    return None;
                }

                let (action, reason) = self.decide(field, erp_value.as_deref(), local_value.as_deref(), local);

                Some(Change {
                    field,
                    erp_value,
                    local_value,
                    priority: field.priority(),
                    action,
                    reason,
                })
            })
            .collect();

        changes.sort_by(|a, b| b.priority.cmp(&a.priority));

        ChangeSet {
            has_changes: !changes.is_empty(),
            changes,
        }
    }

    fn decide(
        &self,
        field: CustomerField,
        erp_value: Option<&str>,
        local_value: Option<&str>,
        local: &CustomerRecord,
    ) -> (ChangeAction, &'static str) {
        let Some(strategy) = self.strategy_for(field) else {
            if self.warned_fields.insert(field) {
                tracing::warn!("No source strategy for field '{}', differences will be skipped", field);
            }
            return (ChangeAction::Skip, "no strategy for field");
        };

        match (erp_value, local_value) {
            (None, None) => return (ChangeAction::Skip, "both sides empty"),
            (Some(e), Some(l)) if e == l => return (ChangeAction::Skip, "values equal"),
            _ => {}
        }

        match strategy {
            SourceStrategy::ErpAlways => match erp_value {
                Some(_) => (ChangeAction::TakeErp, "ERP is authoritative for this field"),
                None => (ChangeAction::Skip, "ERP has no value"),
            },

            SourceStrategy::LocalAlways => match (erp_value, local_value) {
                (None, Some(_)) => (ChangeAction::TakeLocal, "local value missing in ERP"),
                (Some(_), None) => (ChangeAction::TakeErp, "ERP value missing locally"),
                _ => (ChangeAction::Skip, "local value wins"),
            },

            SourceStrategy::ErpUnlessVerified => {
                let verified = local.is_verified(field);
                match (erp_value, local_value) {
                    (None, Some(_)) if verified => (ChangeAction::TakeLocal, "local value verified, push to ERP"),
                    (None, Some(_)) => (ChangeAction::Skip, "local value not verified"),
                    (Some(_), None) => (ChangeAction::TakeErp, "ERP value missing locally"),
                    _ if verified => (ChangeAction::TakeLocal, "local value verified"),
                    _ => (ChangeAction::TakeErp, "local value not verified, ERP wins"),
                }
            }

            SourceStrategy::Latest => match (erp_value, local_value) {
                (None, Some(_)) => (ChangeAction::TakeLocal, "local value missing in ERP"),
                (Some(_), None) => (ChangeAction::TakeErp, "ERP value missing locally"),
                _ => match (local.local_updated_at, local.erp_updated_at) {
                    (Some(local_ts), Some(erp_ts)) if local_ts > erp_ts => {
                        (ChangeAction::TakeLocal, "local value is newer")
                    }
                    (Some(local_ts), Some(erp_ts)) if erp_ts > local_ts => {
                        (ChangeAction::TakeErp, "ERP value is newer")
                    }
                    _ => (ChangeAction::Merge, "cannot tell which side is newer"),
                },
            },
        }
    }

    /// `{erp_field: local_value}` for every `take_local` change.
    pub fn get_fields_to_push(&self, changes: &[Change]) -> ErpPayload {
        changes
            .iter()
            .filter(|c| c.action == ChangeAction::TakeLocal)
            .filter_map(|c| {
                c.local_value
                    .as_ref()
                    .map(|v| (c.field.erp_name().to_string(), v.clone()))
            })
            .collect()
    }

    /// `{local_field: erp_value}` for every `take_erp` change.
    pub fn get_fields_to_pull(&self, changes: &[Change]) -> BTreeMap<CustomerField, String> {
        changes
            .iter()
            .filter(|c| c.action == ChangeAction::TakeErp)
            .filter_map(|c| c.erp_value.as_ref().map(|v| (c.field, v.clone())))
            .collect()
    }

    /// Append one audit row per non-skip change. Returns the number written.
    pub async fn log_changes(
        &self,
        store: &dyn SyncStore,
        customer_id: i64,
        changes: &[Change],
        direction: SyncDirection,
    ) -> Result<usize> {
        let now = Utc::now();
        let rows: Vec<FieldChange> = changes
            .iter()
            .filter(|c| c.action != ChangeAction::Skip)
            .map(|c| {
                let (new_value, source) = match c.action {
                    ChangeAction::TakeErp => (c.erp_value.clone(), "erp"),
                    _ => (c.local_value.clone(), "local"),
                };
                FieldChange {
                    customer_id,
                    field_name: c.field.local_name().to_string(),
                    old_value: c.local_value.clone(),
                    new_value,
                    source: source.to_string(),
                    change_type: c.action.as_str().to_string(),
                    reason: format!("{} ({})", c.reason, direction.as_str()),
                    created_at: now,
                }
            })
            .collect();

        if rows.is_empty() {
            return Ok(0);
        }

        store.append_field_changes(&rows).await?;
        tracing::debug!("Recorded {} field changes for customer {}", rows.len(), customer_id);
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemorySyncStore;
    use chrono::Duration;

    fn erp(mobile: Option<&str>, email: Option<&str>) -> ErpCustomer {
        ErpCustomer {
            ord: Some("572".to_string()),
            mobile: mobile.map(String::from),
            email: email.map(String::from),
            ..Default::default()
        }
    }

    fn local(phone: Option<&str>, email: Option<&str>) -> CustomerRecord {
        CustomerRecord {
            erp_customer_id: Some(572),
            phone: phone.map(String::from),
            email: email.map(String::from),
            ..Default::default()
        }
    }

    #[test]
    fn test_equal_values_produce_no_change() {
        let detector = ChangeDetector::new();
        let result = detector.detect_changes(
            &erp(Some(" 13800001111 "), Some("a@x.com")),
            &local(Some("13800001111"), Some("a@x.com")),
        );

        assert!(!result.has_changes);
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::Skip);
    }

    #[test]
    fn test_equal_values_skip_under_every_strategy() {
        for strategy in ["erp_always", "local_always", "erp_unless_verified", "latest"] {
            let overrides = HashMap::from([("phone".to_string(), strategy.to_string())]);
            let detector = ChangeDetector::with_overrides(&overrides);
            let result = detector.detect_changes(
                &erp(Some("13800001111"), None),
                &local(Some("13800001111"), None),
            );
            assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::Skip, "{}", strategy);
        }
    }

    #[test]
    fn test_sentinel_values_are_absent() {
        let detector = ChangeDetector::new();
        let result = detector.detect_changes(&erp(Some("null"), Some("")), &local(None, Some("None")));
        assert!(!result.has_changes);
    }

    #[test]
    fn test_erp_unless_verified() {
        let detector = ChangeDetector::new();

        let unverified = local(Some("13900002222"), None);
        let result = detector.detect_changes(&erp(Some("13800001111"), None), &unverified);
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::TakeErp);

        let verified = CustomerRecord {
            phone_verified: true,
            ..unverified.clone()
        };
        let result = detector.detect_changes(&erp(Some("13800001111"), None), &verified);
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::TakeLocal);

        let result = detector.detect_changes(&erp(None, None), &unverified);
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::Skip);

        let result = detector.detect_changes(&erp(None, None), &verified);
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::TakeLocal);

        let result = detector.detect_changes(&erp(Some("13800001111"), None), &local(None, None));
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::TakeErp);
    }

    #[test]
    fn test_erp_always_never_takes_local() {
        let detector = ChangeDetector::new();
        let record = CustomerRecord {
            erp_customer_code: Some("KH-LOCAL".to_string()),
            ..Default::default()
        };

        let result = detector.detect_changes(&ErpCustomer::default(), &record);
        assert_eq!(result.action_for(CustomerField::ErpCustomerCode), ChangeAction::Skip);

        let snapshot = ErpCustomer {
            khid: Some("KH-001".to_string()),
            ..Default::default()
        };
        let result = detector.detect_changes(&snapshot, &record);
        assert_eq!(result.action_for(CustomerField::ErpCustomerCode), ChangeAction::TakeErp);
    }

    #[test]
    fn test_local_always() {
        let detector = ChangeDetector::new();
        let with_wechat = CustomerRecord {
            wechat_id: Some("wx_local".to_string()),
            ..Default::default()
        };

        let both = ErpCustomer {
            weixin_acc: Some("wx_erp".to_string()),
            ..Default::default()
        };
        assert_eq!(
            detector.detect_changes(&both, &with_wechat).action_for(CustomerField::WechatId),
            ChangeAction::Skip
        );
        assert_eq!(
            detector
                .detect_changes(&ErpCustomer::default(), &with_wechat)
                .action_for(CustomerField::WechatId),
            ChangeAction::TakeLocal
        );
        assert_eq!(
            detector
                .detect_changes(&both, &CustomerRecord::default())
                .action_for(CustomerField::WechatId),
            ChangeAction::TakeErp
        );
    }

    #[test]
    fn test_latest_uses_timestamps() {
        let detector = ChangeDetector::new();
        let now = Utc::now();

        let mut record = local(None, Some("old@x.com"));
        let snapshot = erp(None, Some("new@x.com"));

        let result = detector.detect_changes(&snapshot, &record);
        assert_eq!(result.action_for(CustomerField::Email), ChangeAction::Merge);

        record.local_updated_at = Some(now);
        record.erp_updated_at = Some(now);
        let result = detector.detect_changes(&snapshot, &record);
        assert_eq!(result.action_for(CustomerField::Email), ChangeAction::Merge);

        record.local_updated_at = Some(now + Duration::minutes(5));
        let result = detector.detect_changes(&snapshot, &record);
        assert_eq!(result.action_for(CustomerField::Email), ChangeAction::TakeLocal);

        record.erp_updated_at = Some(now + Duration::minutes(10));
        let result = detector.detect_changes(&snapshot, &record);
        assert_eq!(result.action_for(CustomerField::Email), ChangeAction::TakeErp);
    }

    #[test]
    fn test_changes_sorted_by_priority() {
        let detector = ChangeDetector::new();
        let snapshot = ErpCustomer {
            ord: Some("572".to_string()),
            name: Some("ACME Co".to_string()),
            mobile: Some("13800001111".to_string()),
            address: Some("1 Main St".to_string()),
            ..Default::default()
        };
        let result = detector.detect_changes(&snapshot, &CustomerRecord::default());

        let fields: Vec<CustomerField> = result.changes.iter().map(|c| c.field).collect();
        assert_eq!(
            fields,
            vec![
                CustomerField::Phone,
                CustomerField::CompanyName,
                CustomerField::Address,
                CustomerField::ErpCustomerId,
            ]
        );
    }

    #[test]
    fn test_unknown_strategy_skips() {
        let overrides = HashMap::from([("phone".to_string(), "coin_flip".to_string())]);
        let detector = ChangeDetector::with_overrides(&overrides);

        assert_eq!(detector.strategy_for(CustomerField::Phone), None);
        let result = detector.detect_changes(&erp(Some("13800001111"), None), &local(None, None));
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::Skip);
        let again = detector.detect_changes(&erp(Some("13800001111"), None), &local(None, None));
        assert_eq!(again.action_for(CustomerField::Phone), ChangeAction::Skip);
    }

    #[test]
    fn test_fields_to_push_and_pull() {
        let detector = ChangeDetector::new();
        let record = CustomerRecord {
            phone: Some("13900002222".to_string()),
            phone_verified: true,
            wechat_id: Some("wx_local".to_string()),
            ..Default::default()
        };
        let snapshot = ErpCustomer {
            mobile: Some("13800001111".to_string()),
            name: Some("ACME Co".to_string()),
            ..Default::default()
        };
        let result = detector.detect_changes(&snapshot, &record);

        let push = detector.get_fields_to_push(&result.changes);
        assert_eq!(push.get("mobile").map(String::as_str), Some("13900002222"));
        assert_eq!(push.get("weixinAcc").map(String::as_str), Some("wx_local"));

        let pull = detector.get_fields_to_pull(&result.changes);
        assert_eq!(pull.get(&CustomerField::CompanyName).map(String::as_str), Some("ACME Co"));
        assert!(!pull.contains_key(&CustomerField::Phone));
    }

    #[tokio::test]
    async fn test_log_changes_skips_skip_actions() {
        let store = InMemorySyncStore::new();
        let detector = ChangeDetector::new();
        let record = CustomerRecord {
            phone: Some("13900002222".to_string()),
            ..Default::default()
        };
        let snapshot = ErpCustomer {
            name: Some("ACME Co".to_string()),
            ..Default::default()
        };
        let result = detector.detect_changes(&snapshot, &record);
        assert_eq!(result.action_for(CustomerField::Phone), ChangeAction::Skip);

        let written = detector
            .log_changes(&store, 9, &result.changes, SyncDirection::ErpToLocal)
            .await
            .unwrap();

        let rows = store.field_changes().await;
        assert_eq!(written, 1);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].field_name, "company_name");
        assert_eq!(rows[0].change_type, "take_erp");
        assert_eq!(rows[0].source, "erp");
        assert_eq!(rows[0].new_value.as_deref(), Some("ACME Co"));
    }
}
