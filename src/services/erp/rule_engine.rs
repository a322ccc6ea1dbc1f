// Sync Rule Engine
// Decides whether a local customer should be created in, updated in, or kept
// out of the ERP. Rules are evaluated in strictly descending priority and the
// first match wins.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::middleware::metrics::record_rule_match;
use crate::models::{normalize_value, CustomerRecord, SyncAction, SyncRuleRecord};
use crate::repositories::SyncStore;
use crate::services::erp::error::{Result, SyncError};

const PERSONAL_NAME_MARKERS: [&str; 4] = ["先生", "女士", "老板", "小姐"];

pub const DEFAULT_MIN_QUALITY_SCORE: f64 = 80.0;
pub const DEFAULT_MIN_INTENT_SCORE: f64 = 30.0;
pub const DEFAULT_MIN_MESSAGE_COUNT: i64 = 5;

// ============================================================================
// Quality Score
// ============================================================================

fn looks_like_company(name: &str) -> bool {
    name.chars().count() >= 4 && !PERSONAL_NAME_MARKERS.iter().any(|m| name.contains(m))
}

/// Deterministic 0-100 data quality score.
///
/// | Evidence                      | Verified | Present |
/// |-------------------------------|----------|---------|
/// | phone                         | 30       | 15      |
/// | company name (not a person)   | 30       | 20      |
/// | business licence              | 20       | 10      |
///
/// Intent adds 20 (>= 80), 15 (>= 60) or 10 (>= 40).
pub fn quality_score(customer: &CustomerRecord) -> f64 {
    let mut score = 0.0;

    if normalize_value(customer.phone.as_deref()).is_some() {
        score += if customer.phone_verified { 30.0 } else { 15.0 };
    }

    if let Some(company) = normalize_value(customer.company_name.as_deref()) {
        if looks_like_company(&company) {
            score += if customer.company_name_verified { 30.0 } else { 20.0 };
        }
    }

    if customer.business_license_verified {
        score += 20.0;
    } else if normalize_value(customer.business_license_path.as_deref()).is_some() {
        score += 10.0;
    }

    score += match customer.intent_score {
        s if s >= 80.0 => 20.0,
        s if s >= 60.0 => 15.0,
        s if s >= 40.0 => 10.0,
        _ => 0.0,
    };

    score
}

// ============================================================================
// Rules
// ============================================================================

/// Declarative condition used by custom rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Condition {
    Present { field: String },
    Absent { field: String },
    IsTrue { field: String },
    IsFalse { field: String },
    Gte { field: String, value: f64 },
    Lt { field: String, value: f64 },
}

enum Attribute {
    Text(Option<String>),
    Flag(bool),
    Number(f64),
}

fn attribute(customer: &CustomerRecord, field: &str) -> Option<Attribute> {
    let text = |v: &Option<String>| Attribute::Text(normalize_value(v.as_deref()));

    Some(match field {
        "phone" => text(&customer.phone),
        "company_name" => text(&customer.company_name),
        "real_name" => text(&customer.real_name),
        "email" => text(&customer.email),
        "address" => text(&customer.address),
        "wechat_id" => text(&customer.wechat_id),
        "wechat_nickname" => text(&customer.wechat_nickname),
        "business_license_path" => text(&customer.business_license_path),
        "erp_customer_code" => text(&customer.erp_customer_code),
        "erp_customer_id" => Attribute::Text(customer.erp_customer_id.map(|id| id.to_string())),
        "has_order" => Attribute::Flag(customer.has_order),
        "has_contract" => Attribute::Flag(customer.has_contract),
        "has_payment" => Attribute::Flag(customer.has_payment),
        "has_quote_request" => Attribute::Flag(customer.has_quote_request),
        "marked_as_important" => Attribute::Flag(customer.marked_as_important),
        "marked_as_invalid" => Attribute::Flag(customer.marked_as_invalid),
        "phone_verified" => Attribute::Flag(customer.phone_verified),
        "company_name_verified" => Attribute::Flag(customer.company_name_verified),
        "real_name_verified" => Attribute::Flag(customer.real_name_verified),
        "business_license_verified" => Attribute::Flag(customer.business_license_verified),
        "intent_score" => Attribute::Number(customer.intent_score),
        "message_count" => Attribute::Number(customer.message_count as f64),
        "conversation_days" => Attribute::Number(customer.conversation_days as f64),
        "data_quality_score" => Attribute::Number(customer.data_quality_score),
        "erp_customer_type" => Attribute::Number(customer.erp_customer_type as f64),
        _ => return None,
    })
}

impl Condition {
    fn field(&self) -> &str {
        match self {
            Condition::Present { field }
            | Condition::Absent { field }
            | Condition::IsTrue { field }
            | Condition::IsFalse { field }
            | Condition::Gte { field, .. }
            | Condition::Lt { field, .. } => field,
        }
    }

    /// Reject unknown fields and operators applied to the wrong kind of field.
    fn validate(&self) -> std::result::Result<(), String> {
        let sample = CustomerRecord::default();
        let kind_ok = match (self, attribute(&sample, self.field())) {
            (_, None) => return Err(format!("unknown field '{}'", self.field())),
            (Condition::Present { .. } | Condition::Absent { .. }, Some(Attribute::Text(_))) => true,
            (Condition::IsTrue { .. } | Condition::IsFalse { .. }, Some(Attribute::Flag(_))) => true,
            (Condition::Gte { .. } | Condition::Lt { .. }, Some(Attribute::Number(_))) => true,
            _ => false,
        };

        if kind_ok {
            Ok(())
        } else {
            Err(format!("operator does not apply to field '{}'", self.field()))
        }
    }

    fn holds(&self, customer: &CustomerRecord) -> bool {
        match (self, attribute(customer, self.field())) {
            (Condition::Present { .. }, Some(Attribute::Text(v))) => v.is_some(),
            (Condition::Absent { .. }, Some(Attribute::Text(v))) => v.is_none(),
            (Condition::IsTrue { .. }, Some(Attribute::Flag(b))) => b,
            (Condition::IsFalse { .. }, Some(Attribute::Flag(b))) => !b,
            (Condition::Gte { value, .. }, Some(Attribute::Number(n))) => n >= *value,
            (Condition::Lt { value, .. }, Some(Attribute::Number(n))) => n < *value,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleKind {
    Mandatory,
    HighQuality {
        min_quality_score: f64,
    },
    MediumQuality,
    LowQualitySkip {
        min_intent_score: f64,
        min_message_count: i64,
    },
    Custom {
        conditions: Vec<Condition>,
        action: SyncAction,
        confidence: f64,
    },
}

impl RuleKind {
    pub fn type_name(&self) -> &'static str {
        match self {
            RuleKind::Mandatory => "mandatory",
            RuleKind::HighQuality { .. } => "high_quality",
            RuleKind::MediumQuality => "medium_quality",
            RuleKind::LowQualitySkip { .. } => "low_quality",
            RuleKind::Custom { .. } => "custom",
        }
    }
}

#[derive(Debug, Deserialize, Default)]
struct RuleParams {
    min_quality_score: Option<f64>,
    min_intent_score: Option<f64>,
    min_message_count: Option<i64>,
    confidence: Option<f64>,
    #[serde(default)]
    all: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncRule {
    pub name: String,
    pub priority: i32,
    pub kind: RuleKind,
    pub description: Option<String>,
}

/// Outcome of a single rule that matched.
struct RuleMatch {
    action: SyncAction,
    confidence: f64,
    reason: String,
}

fn create_or_update(customer: &CustomerRecord) -> SyncAction {
    if customer.erp_customer_id.is_some() {
        SyncAction::Update
    } else {
        SyncAction::Create
    }
}

impl SyncRule {
    fn new(name: &str, priority: i32, kind: RuleKind) -> Self {
        Self {
            name: name.to_string(),
            priority,
            kind,
            description: None,
        }
    }

    /// Validate a stored rule row into a rule.
    pub fn from_record(record: &SyncRuleRecord) -> std::result::Result<Self, String> {
        let params: RuleParams = if record.conditions.is_null() {
            RuleParams::default()
        } else {
            serde_json::from_value(record.conditions.clone())
                .map_err(|e| format!("malformed conditions: {}", e))?
        };

        let kind = match record.rule_type.as_str() {
            "mandatory" => RuleKind::Mandatory,
            "high_quality" => RuleKind::HighQuality {
                min_quality_score: params.min_quality_score.unwrap_or(DEFAULT_MIN_QUALITY_SCORE),
            },
            "medium_quality" => RuleKind::MediumQuality,
            "low_quality" => RuleKind::LowQualitySkip {
                min_intent_score: params.min_intent_score.unwrap_or(DEFAULT_MIN_INTENT_SCORE),
                min_message_count: params.min_message_count.unwrap_or(DEFAULT_MIN_MESSAGE_COUNT),
            },
            "custom" => {
                if params.all.is_empty() {
                    return Err("custom rule has no conditions".to_string());
                }
                for condition in &params.all {
                    condition.validate()?;
                }
                let action = record
                    .action
                    .as_deref()
                    .ok_or_else(|| "custom rule has no action".to_string())?
                    .parse::<SyncAction>()?;
                let confidence = params.confidence.unwrap_or(0.5);
                if !(0.0..=1.0).contains(&confidence) {
                    return Err(format!("confidence {} outside 0..=1", confidence));
                }
                RuleKind::Custom {
                    conditions: params.all,
                    action,
                    confidence,
                }
            }
            other => return Err(format!("unknown rule type '{}'", other)),
        };

        Ok(Self {
            name: record.name.clone(),
            priority: record.priority,
            kind,
            description: record.description.clone(),
        })
    }

    fn evaluate(&self, customer: &CustomerRecord) -> Option<RuleMatch> {
        match &self.kind {
            RuleKind::Mandatory => {
                let reason = if customer.has_order {
                    "customer has placed an order"
                } else if customer.has_contract {
                    "customer has signed a contract"
                } else if customer.has_payment {
                    "customer has made a payment"
                } else if customer.marked_as_important {
                    "customer marked as important by sales"
                } else {
                    return None;
                };

                Some(RuleMatch {
                    action: create_or_update(customer),
                    confidence: 1.0,
                    reason: reason.to_string(),
                })
            }

            RuleKind::HighQuality { min_quality_score } => {
                let score = quality_score(customer);
                (score >= *min_quality_score).then(|| RuleMatch {
                    action: create_or_update(customer),
                    confidence: score / 100.0,
                    reason: format!("high quality customer (score {:.0})", score),
                })
            }

            RuleKind::MediumQuality => {
                let has_phone = normalize_value(customer.phone.as_deref()).is_some();
                let has_company = normalize_value(customer.company_name.as_deref()).is_some();
                let has_license = normalize_value(customer.business_license_path.as_deref()).is_some();

                let (confidence, reason) = if has_phone && customer.has_quote_request {
                    (0.75, "phone number and explicit quote request".to_string())
                } else if has_company && has_license {
                    (0.8, "company name with business licence".to_string())
                } else if customer.conversation_days >= 7 && customer.message_count >= 50 {
                    (
                        0.7,
                        format!(
                            "sustained engagement ({} days, {} messages)",
                            customer.conversation_days, customer.message_count
                        ),
                    )
                } else {
                    return None;
                };

                Some(RuleMatch {
                    action: create_or_update(customer),
                    confidence,
                    reason,
                })
            }

            RuleKind::LowQualitySkip {
                min_intent_score,
                min_message_count,
            } => {
                let anonymous = normalize_value(customer.phone.as_deref()).is_none()
                    && normalize_value(customer.company_name.as_deref()).is_none()
                    && normalize_value(customer.real_name.as_deref()).is_none();

                let reason = if anonymous {
                    "insufficient identity (no phone, company or real name)".to_string()
                } else if customer.intent_score < *min_intent_score {
                    format!("intent score too low ({:.0})", customer.intent_score)
                } else if customer.message_count < *min_message_count {
                    format!("too few interactions ({} messages)", customer.message_count)
                } else if customer.marked_as_invalid {
                    "marked as invalid".to_string()
                } else {
                    return None;
                };

                Some(RuleMatch {
                    action: SyncAction::Skip,
                    confidence: 0.0,
                    reason,
                })
            }

            RuleKind::Custom {
                conditions,
                action,
                confidence,
            } => {
                if !conditions.iter().all(|c| c.holds(customer)) {
                    return None;
                }

                let action = match action {
                    SyncAction::Skip => SyncAction::Skip,
                    SyncAction::Create | SyncAction::Update => create_or_update(customer),
                };

                Some(RuleMatch {
                    action,
                    confidence: *confidence,
                    reason: format!("matched custom rule '{}'", self.name),
                })
            }
        }
    }
}

// ============================================================================
// Rule Set
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleSource {
    Store,
    Defaults,
}

/// An immutable, validated, priority-ordered list of rules.
#[derive(Debug, Clone, Serialize)]
pub struct RuleSet {
    pub rules: Vec<SyncRule>,
    pub source: RuleSource,
}

impl RuleSet {
    pub fn defaults() -> Self {
        Self {
            rules: vec![
                SyncRule::new("mandatory", 100, RuleKind::Mandatory),
                SyncRule::new(
                    "high_quality",
                    80,
                    RuleKind::HighQuality {
                        min_quality_score: DEFAULT_MIN_QUALITY_SCORE,
                    },
                ),
                SyncRule::new("medium_quality", 50, RuleKind::MediumQuality),
                SyncRule::new(
                    "low_quality",
                    0,
                    RuleKind::LowQualitySkip {
                        min_intent_score: DEFAULT_MIN_INTENT_SCORE,
                        min_message_count: DEFAULT_MIN_MESSAGE_COUNT,
                    },
                ),
            ],
            source: RuleSource::Defaults,
        }
    }

    /// Build from stored rows. Inactive rows are ignored and invalid rows are
    /// skipped with a warning. A priority tie is an error, as is any set that
    /// does not have exactly one mandatory rule at the top.
    pub fn from_records(records: &[SyncRuleRecord]) -> Result<Self> {
        let mut rules = Vec::with_capacity(records.len());

        for record in records.iter().filter(|r| r.is_active) {
            match SyncRule::from_record(record) {
                Ok(rule) => rules.push(rule),
                Err(e) => tracing::warn!("Skipping sync rule '{}': {}", record.name, e),
            }
        }

        if rules.is_empty() {
            return Err(SyncError::RuleLoad("no valid active rules".to_string()));
        }

        let mut seen = HashSet::new();
        for rule in &rules {
            if !seen.insert(rule.priority) {
                return Err(SyncError::RuleLoad(format!(
                    "duplicate rule priority {} ('{}')",
                    rule.priority, rule.name
                )));
            }
        }

        rules.sort_by(|a, b| b.priority.cmp(&a.priority));

        // Order/contract/payment customers must never fall through to a lower tier.
        let mandatory = rules.iter().filter(|r| matches!(r.kind, RuleKind::Mandatory)).count();
        if mandatory != 1 {
            return Err(SyncError::RuleLoad(format!(
                "expected exactly one active mandatory rule, found {}",
                mandatory
            )));
        }
        if !matches!(rules[0].kind, RuleKind::Mandatory) {
            return Err(SyncError::RuleLoad(format!(
                "rule '{}' (priority {}) outranks the mandatory rule",
                rules[0].name, rules[0].priority
            )));
        }

        Ok(Self {
            rules,
            source: RuleSource::Store,
        })
    }
}

// ============================================================================
// Engine
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RuleDecision {
    pub action: SyncAction,
    pub confidence: f64,
    pub reason: String,
    pub matched_rule: String,
}

pub const NO_MATCH_RULE: &str = "default";

pub struct SyncRuleEngine {
    store: Arc<dyn SyncStore>,
    rules: RwLock<Arc<RuleSet>>,
    match_counts: DashMap<String, i64>,
    fallback_active: AtomicBool,
}

impl SyncRuleEngine {
    /// Engine with the built-in rules. Call `reload_rules` to pick up stored rules.
    pub fn new(store: Arc<dyn SyncStore>) -> Self {
        Self {
            store,
            rules: RwLock::new(Arc::new(RuleSet::defaults())),
            match_counts: DashMap::new(),
            fallback_active: AtomicBool::new(false),
        }
    }

    pub async fn load(store: Arc<dyn SyncStore>) -> Self {
        let engine = Self::new(store);
        engine.reload_rules().await;
        engine
    }

    /// Current rule set. In-flight callers keep the set they started with.
    pub fn rules(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn swap_rules(&self, rule_set: RuleSet) {
        let mut guard = self
            .rules
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(rule_set);
    }

    /// Rebuild the rule set from the store, falling back to the built-in
    /// rules when the store is unreadable or its rules are invalid.
    pub async fn reload_rules(&self) -> RuleSource {
        let loaded = match self.store.load_sync_rules().await {
            Ok(records) => RuleSet::from_records(&records),
            Err(e) => Err(SyncError::RuleLoad(e.to_string())),
        };

        match loaded {
            Ok(rule_set) => {
                if self.fallback_active.swap(false, Ordering::SeqCst) {
                    tracing::info!("Sync rules recovered from store");
                }
                tracing::debug!("Loaded {} sync rules from store", rule_set.rules.len());
                self.swap_rules(rule_set);
                RuleSource::Store
            }
            Err(e) => {
                if !self.fallback_active.swap(true, Ordering::SeqCst) {
                    tracing::error!("Failed to load sync rules, using built-in defaults: {}", e);
                }
                self.swap_rules(RuleSet::defaults());
                RuleSource::Defaults
            }
        }
    }

    /// Evaluate a customer against the current rules. Never fails.
    pub fn evaluate(&self, customer: &CustomerRecord) -> RuleDecision {
        let rule_set = self.rules();

        for rule in &rule_set.rules {
            if let Some(m) = rule.evaluate(customer) {
                *self.match_counts.entry(rule.name.clone()).or_insert(0) += 1;
                record_rule_match(&rule.name);

                return RuleDecision {
                    action: m.action,
                    confidence: m.confidence,
                    reason: m.reason,
                    matched_rule: rule.name.clone(),
                };
            }
        }

        record_rule_match(NO_MATCH_RULE);
        RuleDecision {
            action: SyncAction::Skip,
            confidence: 0.0,
            reason: "no rule matched".to_string(),
            matched_rule: NO_MATCH_RULE.to_string(),
        }
    }

    /// Match counts not yet written to the store.
    pub fn pending_match_counts(&self) -> BTreeMap<String, i64> {
        self.match_counts
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }

    /// Persist accumulated match counts. On failure the counts are kept for
    /// the next flush and the error is only logged.
    pub async fn flush_match_counts(&self) {
        let counts: Vec<(String, i64)> = self
            .pending_match_counts()
            .into_keys()
            .filter_map(|name| self.match_counts.remove(&name))
            .filter(|(_, count)| *count > 0)
            .collect();

        if counts.is_empty() {
            return;
        }

        if let Err(e) = self.store.increment_rule_matches(&counts).await {
            tracing::warn!("Failed to persist rule match counts: {}", e);
            for (name, count) in counts {
                *self.match_counts.entry(name).or_insert(0) += count;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::InMemorySyncStore;
    use serde_json::json;

    fn record(name: &str, rule_type: &str, priority: i32, conditions: serde_json::Value) -> SyncRuleRecord {
        SyncRuleRecord {
            id: 0,
            name: name.to_string(),
            rule_type: rule_type.to_string(),
            priority,
            conditions,
            action: None,
            description: None,
            match_count: 0,
            is_active: true,
        }
    }

    fn engine() -> SyncRuleEngine {
        SyncRuleEngine::new(Arc::new(InMemorySyncStore::new()))
    }

    fn engaged() -> CustomerRecord {
        CustomerRecord {
            phone: Some("13800001111".to_string()),
            intent_score: 50.0,
            message_count: 20,
            ..Default::default()
        }
    }

    #[test]
    fn test_mandatory_create_and_update() {
        let engine = engine();
        let customer = CustomerRecord {
            has_order: true,
            ..Default::default()
        };

        let decision = engine.evaluate(&customer);
        assert_eq!(decision.action, SyncAction::Create);
        assert_eq!(decision.confidence, 1.0);
        assert_eq!(decision.matched_rule, "mandatory");

        let linked = CustomerRecord {
            erp_customer_id: Some(100),
            ..customer
        };
        assert_eq!(engine.evaluate(&linked).action, SyncAction::Update);
    }

    #[test]
    fn test_quality_score_components() {
        let customer = CustomerRecord {
            phone: Some("13800001111".to_string()),
            phone_verified: true,
            company_name: Some("深圳某某科技有限公司".to_string()),
            business_license_path: Some("/licenses/1.jpg".to_string()),
            intent_score: 65.0,
            ..Default::default()
        };
        assert_eq!(quality_score(&customer), 30.0 + 20.0 + 10.0 + 15.0);
    }

    #[test]
    fn test_quality_score_ignores_personal_names() {
        let customer = CustomerRecord {
            company_name: Some("王先生的店铺".to_string()),
            ..Default::default()
        };
        assert_eq!(quality_score(&customer), 0.0);

        let short = CustomerRecord {
            company_name: Some("ABC".to_string()),
            ..Default::default()
        };
        assert_eq!(quality_score(&short), 0.0);
    }

    #[test]
    fn test_quality_score_monotonic_under_verification() {
        let base = CustomerRecord {
            phone: Some("13800001111".to_string()),
            company_name: Some("ACME Trading Co".to_string()),
            business_license_path: Some("/licenses/2.jpg".to_string()),
            intent_score: 45.0,
            ..Default::default()
        };
        let before = quality_score(&base);

        for verified in [
            CustomerRecord { phone_verified: true, ..base.clone() },
            CustomerRecord { company_name_verified: true, ..base.clone() },
            CustomerRecord { business_license_verified: true, ..base.clone() },
        ] {
            assert!(quality_score(&verified) >= before);
        }
    }

    #[test]
    fn test_high_quality_match() {
        let engine = engine();
        let customer = CustomerRecord {
            phone: Some("13800001111".to_string()),
            phone_verified: true,
            company_name: Some("ACME Trading Co".to_string()),
            company_name_verified: true,
            intent_score: 85.0,
            message_count: 10,
            ..Default::default()
        };

        let decision = engine.evaluate(&customer);
        assert_eq!(decision.matched_rule, "high_quality");
        assert_eq!(decision.action, SyncAction::Create);
        assert!((decision.confidence - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn test_medium_quality_combinations() {
        let engine = engine();

        let quote = CustomerRecord {
            has_quote_request: true,
            ..engaged()
        };
        let decision = engine.evaluate(&quote);
        assert_eq!(decision.matched_rule, "medium_quality");
        assert_eq!(decision.confidence, 0.75);

        let licensed = CustomerRecord {
            company_name: Some("ACME".to_string()),
            business_license_path: Some("/l.jpg".to_string()),
            intent_score: 50.0,
            message_count: 20,
            ..Default::default()
        };
        assert_eq!(engine.evaluate(&licensed).confidence, 0.8);

        let chatty = CustomerRecord {
            conversation_days: 7,
            message_count: 50,
            ..engaged()
        };
        assert_eq!(engine.evaluate(&chatty).confidence, 0.7);
    }

    #[test]
    fn test_low_quality_skip() {
        let engine = engine();

        let anonymous = CustomerRecord {
            wechat_nickname: Some("Visitor".to_string()),
            intent_score: 10.0,
            message_count: 3,
            ..Default::default()
        };
        let decision = engine.evaluate(&anonymous);
        assert_eq!(decision.action, SyncAction::Skip);
        assert_eq!(decision.matched_rule, "low_quality");
        assert_eq!(decision.confidence, 0.0);

        let invalid = CustomerRecord {
            marked_as_invalid: true,
            ..engaged()
        };
        assert_eq!(engine.evaluate(&invalid).matched_rule, "low_quality");
    }

    #[test]
    fn test_no_rule_matched() {
        let engine = engine();
        let decision = engine.evaluate(&engaged());

        assert_eq!(decision.action, SyncAction::Skip);
        assert_eq!(decision.matched_rule, NO_MATCH_RULE);
        assert_eq!(decision.reason, "no rule matched");
    }

    #[test]
    fn test_duplicate_priorities_rejected() {
        let records = vec![
            record("mandatory", "mandatory", 100, json!({})),
            record("also_mandatory", "mandatory", 100, json!({})),
        ];
        assert!(matches!(RuleSet::from_records(&records), Err(SyncError::RuleLoad(_))));
    }

    #[test]
    fn test_missing_mandatory_rejected() {
        let records = vec![
            record("high_quality", "high_quality", 80, json!({})),
            record("low_quality", "low_quality", 0, json!({})),
        ];
        assert!(matches!(RuleSet::from_records(&records), Err(SyncError::RuleLoad(_))));

        let mut inactive = record("mandatory", "mandatory", 100, json!({}));
        inactive.is_active = false;
        let records = vec![inactive, record("low_quality", "low_quality", 0, json!({}))];
        assert!(matches!(RuleSet::from_records(&records), Err(SyncError::RuleLoad(_))));
    }

    #[test]
    fn test_rule_above_mandatory_rejected() {
        let mut skip_all = record(
            "skip_everyone",
            "custom",
            200,
            json!({"all": [{"op": "present", "field": "phone"}]}),
        );
        skip_all.action = Some("SKIP".to_string());
        let records = vec![skip_all, record("mandatory", "mandatory", 100, json!({}))];
        assert!(matches!(RuleSet::from_records(&records), Err(SyncError::RuleLoad(_))));

        let records = vec![
            record("mandatory", "mandatory", 100, json!({})),
            record("second_mandatory", "mandatory", 90, json!({})),
        ];
        assert!(matches!(RuleSet::from_records(&records), Err(SyncError::RuleLoad(_))));
    }

    #[tokio::test]
    async fn test_store_without_mandatory_keeps_order_customers_created() {
        let store = Arc::new(
            InMemorySyncStore::with_rules(vec![record("low_quality", "low_quality", 0, json!({}))]).await,
        );
        let engine = SyncRuleEngine::new(store);
        assert_eq!(engine.reload_rules().await, RuleSource::Defaults);

        let customer = CustomerRecord {
            has_order: true,
            ..Default::default()
        };
        let decision = engine.evaluate(&customer);
        assert_eq!(decision.action, SyncAction::Create);
        assert_eq!(decision.matched_rule, "mandatory");
    }

    #[test]
    fn test_unknown_rule_types_skipped() {
        let records = vec![
            record("mandatory", "mandatory", 100, json!({})),
            record("mystery", "astrology", 90, json!({})),
        ];
        let rule_set = RuleSet::from_records(&records).unwrap();
        assert_eq!(rule_set.rules.len(), 1);
        assert_eq!(rule_set.source, RuleSource::Store);
    }

    #[test]
    fn test_custom_rule_validation() {
        let mut custom = record(
            "vip_region",
            "custom",
            90,
            json!({"all": [{"op": "present", "field": "phone"}, {"op": "gte", "field": "intent_score", "value": 70}], "confidence": 0.9}),
        );
        custom.action = Some("CREATE".to_string());
        let rule = SyncRule::from_record(&custom).unwrap();
        assert_eq!(rule.kind.type_name(), "custom");

        let mut wrong_kind = custom.clone();
        wrong_kind.conditions = json!({"all": [{"op": "gte", "field": "phone", "value": 1}]});
        assert!(SyncRule::from_record(&wrong_kind).is_err());

        let mut unknown_field = custom.clone();
        unknown_field.conditions = json!({"all": [{"op": "present", "field": "shoe_size"}]});
        assert!(SyncRule::from_record(&unknown_field).is_err());
    }

    #[tokio::test]
    async fn test_custom_rule_evaluation() {
        let mut custom = record(
            "hot_lead",
            "custom",
            90,
            json!({"all": [{"op": "present", "field": "phone"}, {"op": "gte", "field": "intent_score", "value": 70}], "confidence": 0.9}),
        );
        custom.action = Some("CREATE".to_string());
        let store = Arc::new(
            InMemorySyncStore::with_rules(vec![record("mandatory", "mandatory", 100, json!({})), custom]).await,
        );
        let engine = SyncRuleEngine::load(store).await;

        let hot = CustomerRecord {
            intent_score: 75.0,
            erp_customer_id: Some(42),
            ..engaged()
        };
        let decision = engine.evaluate(&hot);
        assert_eq!(decision.matched_rule, "hot_lead");
        assert_eq!(decision.action, SyncAction::Update);
        assert_eq!(decision.confidence, 0.9);
    }

    #[tokio::test]
    async fn test_reload_falls_back_to_defaults() {
        let store = Arc::new(InMemorySyncStore::new());
        store.fail_rule_loads(true).await;
        let engine = SyncRuleEngine::new(store.clone());

        assert_eq!(engine.reload_rules().await, RuleSource::Defaults);
        assert_eq!(engine.reload_rules().await, RuleSource::Defaults);
        assert_eq!(engine.rules().rules.len(), 4);

        store.fail_rule_loads(false).await;
        store
            .set_rules(vec![record("mandatory", "mandatory", 100, json!({}))])
            .await;
        assert_eq!(engine.reload_rules().await, RuleSource::Store);
        assert_eq!(engine.rules().rules.len(), 1);
    }

    #[tokio::test]
    async fn test_empty_store_uses_defaults() {
        let engine = SyncRuleEngine::load(Arc::new(InMemorySyncStore::new())).await;
        assert_eq!(engine.rules().source, RuleSource::Defaults);
    }

    #[tokio::test]
    async fn test_in_flight_evaluation_keeps_its_rule_set() {
        let store = Arc::new(InMemorySyncStore::new());
        let engine = SyncRuleEngine::new(store.clone());
        let snapshot = engine.rules();

        store
            .set_rules(vec![record("mandatory", "mandatory", 100, json!({}))])
            .await;
        engine.reload_rules().await;

        assert_eq!(snapshot.rules.len(), 4);
        assert_eq!(engine.rules().rules.len(), 1);
    }

    #[tokio::test]
    async fn test_match_counts_flushed_and_retained_on_failure() {
        let store = Arc::new(
            InMemorySyncStore::with_rules(vec![record("mandatory", "mandatory", 100, json!({}))]).await,
        );
        let engine = SyncRuleEngine::load(store.clone()).await;
        let customer = CustomerRecord {
            has_payment: true,
            ..Default::default()
        };

        engine.evaluate(&customer);
        engine.evaluate(&customer);

        store.fail_rule_match_flush(true).await;
        engine.flush_match_counts().await;
        assert_eq!(engine.pending_match_counts().get("mandatory"), Some(&2));

        store.fail_rule_match_flush(false).await;
        engine.flush_match_counts().await;
        assert!(engine.pending_match_counts().is_empty());
        assert_eq!(store.rules().await[0].match_count, 2);
    }
}
