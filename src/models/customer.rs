use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Sync State
// ============================================================================

/// Push-side state of a local customer.
///
/// `Pending` records are new or were flagged for re-sync by an external writer.
/// Only `Pending` and `Failed` are selected by a push run; `Skipped` and
/// `Synced` wait until an external writer marks them pending again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Skipped,
    Failed,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Synced => "synced",
            SyncStatus::Skipped => "skipped",
            SyncStatus::Failed => "failed",
        }
    }

    pub fn is_push_eligible(&self) -> bool {
        matches!(self, SyncStatus::Pending | SyncStatus::Failed)
    }
}

impl FromStr for SyncStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SyncStatus::Pending),
            "synced" => Ok(SyncStatus::Synced),
            "skipped" => Ok(SyncStatus::Skipped),
            "failed" => Ok(SyncStatus::Failed),
            other => Err(format!("unknown sync status: {}", other)),
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Decision produced by the rule engine for a push candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SyncAction {
    Create,
    Update,
    Skip,
}

impl SyncAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncAction::Create => "CREATE",
            SyncAction::Update => "UPDATE",
            SyncAction::Skip => "SKIP",
        }
    }
}

impl FromStr for SyncAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CREATE" => Ok(SyncAction::Create),
            "UPDATE" => Ok(SyncAction::Update),
            "SKIP" => Ok(SyncAction::Skip),
            other => Err(format!("unknown sync action: {}", other)),
        }
    }
}

impl fmt::Display for SyncAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a field's current value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueSource {
    Erp,
    Local,
    System,
}

impl ValueSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueSource::Erp => "erp",
            ValueSource::Local => "local",
            ValueSource::System => "system",
        }
    }
}

impl FromStr for ValueSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "erp" => Ok(ValueSource::Erp),
            "local" => Ok(ValueSource::Local),
            "system" => Ok(ValueSource::System),
            other => Err(format!("unknown value source: {}", other)),
        }
    }
}

// ============================================================================
// Field Mapping
// ============================================================================

/// The customer fields reconciled between the ERP and the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomerField {
    ErpCustomerId,
    ErpCustomerCode,
    CompanyName,
    RealName,
    Phone,
    Email,
    Address,
    WechatId,
}

impl CustomerField {
    pub const ALL: [CustomerField; 8] = [
        CustomerField::ErpCustomerId,
        CustomerField::ErpCustomerCode,
        CustomerField::CompanyName,
        CustomerField::RealName,
        CustomerField::Phone,
        CustomerField::Email,
        CustomerField::Address,
        CustomerField::WechatId,
    ];

    /// Column name in the local store.
    pub fn local_name(&self) -> &'static str {
        match self {
            CustomerField::ErpCustomerId => "erp_customer_id",
            CustomerField::ErpCustomerCode => "erp_customer_code",
            CustomerField::CompanyName => "company_name",
            CustomerField::RealName => "real_name",
            CustomerField::Phone => "phone",
            CustomerField::Email => "email",
            CustomerField::Address => "address",
            CustomerField::WechatId => "wechat_id",
        }
    }

    /// Field name in the ERP customer payload.
    pub fn erp_name(&self) -> &'static str {
        match self {
            CustomerField::ErpCustomerId => "ord",
            CustomerField::ErpCustomerCode => "khid",
            CustomerField::CompanyName => "name",
            CustomerField::RealName => "person_name",
            CustomerField::Phone => "mobile",
            CustomerField::Email => "email",
            CustomerField::Address => "address",
            CustomerField::WechatId => "weixinAcc",
        }
    }

    /// Ordering weight used when sorting detected changes (higher first).
    pub fn priority(&self) -> u8 {
        match self {
            CustomerField::Phone => 10,
            CustomerField::CompanyName => 9,
            CustomerField::RealName => 8,
            CustomerField::Email => 7,
            CustomerField::Address => 6,
            CustomerField::ErpCustomerCode => 4,
            CustomerField::WechatId => 3,
            CustomerField::ErpCustomerId => 0,
        }
    }

    pub fn from_local_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.local_name() == name)
    }
}

impl fmt::Display for CustomerField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.local_name())
    }
}

/// Normalize a raw field value: trims, and treats blank strings and the
/// `null`/`None` sentinels as absent.
pub fn normalize_value(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed == "None" {
        None
    } else {
        Some(trimmed.to_string())
    }
}

// ============================================================================
// Local Customer
// ============================================================================

/// A unified customer as stored locally.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CustomerRecord {
    pub id: i64,

    // Business fields
    pub phone: Option<String>,
    pub phone_source: Option<ValueSource>,
    pub phone_verified: bool,
    pub company_name: Option<String>,
    pub company_name_source: Option<ValueSource>,
    pub company_name_verified: bool,
    pub real_name: Option<String>,
    pub real_name_source: Option<ValueSource>,
    pub real_name_verified: bool,
    pub email: Option<String>,
    pub email_source: Option<ValueSource>,
    pub address: Option<String>,
    pub address_source: Option<ValueSource>,
    pub wechat_id: Option<String>,
    pub wechat_nickname: Option<String>,
    pub business_license_path: Option<String>,
    pub business_license_verified: bool,

    // External identity
    pub erp_customer_id: Option<i64>,
    pub erp_customer_code: Option<String>,
    pub erp_customer_type: i32,

    // Engagement
    pub intent_score: f64,
    pub message_count: i64,
    pub conversation_days: i64,
    pub data_quality_score: f64,

    // Business flags
    pub has_order: bool,
    pub has_contract: bool,
    pub has_payment: bool,
    pub has_quote_request: bool,
    pub marked_as_important: bool,
    pub marked_as_invalid: bool,

    // Sync state
    pub erp_sync_status: SyncStatus,
    pub erp_sync_action: Option<SyncAction>,
    pub erp_sync_rule: Option<String>,
    pub erp_sync_confidence: Option<f64>,
    pub erp_sync_error: Option<String>,
    pub erp_last_pulled_at: Option<DateTime<Utc>>,
    pub erp_last_pushed_at: Option<DateTime<Utc>>,
    pub local_updated_at: Option<DateTime<Utc>>,
    pub erp_updated_at: Option<DateTime<Utc>>,
    /// ERP field name -> value last confirmed to be held by the ERP.
    pub erp_known_values: BTreeMap<String, String>,
}

impl Default for CustomerRecord {
    fn default() -> Self {
        Self {
            id: 0,
            phone: None,
            phone_source: None,
            phone_verified: false,
            company_name: None,
            company_name_source: None,
            company_name_verified: false,
            real_name: None,
            real_name_source: None,
            real_name_verified: false,
            email: None,
            email_source: None,
            address: None,
            address_source: None,
            wechat_id: None,
            wechat_nickname: None,
            business_license_path: None,
            business_license_verified: false,
            erp_customer_id: None,
            erp_customer_code: None,
            erp_customer_type: 1,
            intent_score: 0.0,
            message_count: 0,
            conversation_days: 0,
            data_quality_score: 0.0,
            has_order: false,
            has_contract: false,
            has_payment: false,
            has_quote_request: false,
            marked_as_important: false,
            marked_as_invalid: false,
            erp_sync_status: SyncStatus::Pending,
            erp_sync_action: None,
            erp_sync_rule: None,
            erp_sync_confidence: None,
            erp_sync_error: None,
            erp_last_pulled_at: None,
            erp_last_pushed_at: None,
            local_updated_at: None,
            erp_updated_at: None,
            erp_known_values: BTreeMap::new(),
        }
    }
}

impl CustomerRecord {
    /// Normalized value of a reconciled field.
    pub fn field_value(&self, field: CustomerField) -> Option<String> {
        match field {
            CustomerField::ErpCustomerId => self.erp_customer_id.map(|id| id.to_string()),
            CustomerField::ErpCustomerCode => normalize_value(self.erp_customer_code.as_deref()),
            CustomerField::CompanyName => normalize_value(self.company_name.as_deref()),
            CustomerField::RealName => normalize_value(self.real_name.as_deref()),
            CustomerField::Phone => normalize_value(self.phone.as_deref()),
            CustomerField::Email => normalize_value(self.email.as_deref()),
            CustomerField::Address => normalize_value(self.address.as_deref()),
            CustomerField::WechatId => normalize_value(self.wechat_id.as_deref()),
        }
    }

    /// Whether an external writer has flagged the field as verified.
    /// Fields without a verification flag are never verified.
    pub fn is_verified(&self, field: CustomerField) -> bool {
        match field {
            CustomerField::Phone => self.phone_verified,
            CustomerField::CompanyName => self.company_name_verified,
            CustomerField::RealName => self.real_name_verified,
            _ => false,
        }
    }

    /// Overwrite a reconciled field and tag its provenance.
    ///
    /// `erp_customer_id` is not settable here; identity assignment goes through
    /// the sync service so the uniqueness checks cannot be bypassed.
    pub fn set_field(&mut self, field: CustomerField, value: Option<String>, source: ValueSource) {
        match field {
            CustomerField::ErpCustomerId => {}
            CustomerField::ErpCustomerCode => self.erp_customer_code = value,
            CustomerField::CompanyName => {
                self.company_name = value;
                self.company_name_source = Some(source);
            }
            CustomerField::RealName => {
                self.real_name = value;
                self.real_name_source = Some(source);
            }
            CustomerField::Phone => {
                self.phone = value;
                self.phone_source = Some(source);
            }
            CustomerField::Email => {
                self.email = value;
                self.email_source = Some(source);
            }
            CustomerField::Address => {
                self.address = value;
                self.address_source = Some(source);
            }
            CustomerField::WechatId => self.wechat_id = value,
        }
    }

    pub fn has_business_commitment(&self) -> bool {
        self.has_order || self.has_contract || self.has_payment
    }

    /// Best available display name (company, then person, then nickname).
    pub fn display_name(&self) -> Option<String> {
        normalize_value(self.company_name.as_deref())
            .or_else(|| normalize_value(self.real_name.as_deref()))
            .or_else(|| normalize_value(self.wechat_nickname.as_deref()))
    }
}

// ============================================================================
// ERP Customer Snapshot
// ============================================================================

/// A customer row as returned by the ERP list endpoint.
///
/// The ERP is loosely typed: ids arrive as numbers or strings, blanks as `""`.
/// Every field is read into an optional string and normalized on access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ErpCustomer {
    #[serde(default, deserialize_with = "loose_string")]
    pub ord: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub khid: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub name: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub person_name: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub mobile: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub email: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub address: Option<String>,
    #[serde(rename = "weixinAcc", default, deserialize_with = "loose_string")]
    pub weixin_acc: Option<String>,
    #[serde(default, deserialize_with = "loose_string")]
    pub intsort: Option<String>,
}

impl ErpCustomer {
    pub fn field_value(&self, field: CustomerField) -> Option<String> {
        let raw = match field {
            CustomerField::ErpCustomerId => self.ord.as_deref(),
            CustomerField::ErpCustomerCode => self.khid.as_deref(),
            CustomerField::CompanyName => self.name.as_deref(),
            CustomerField::RealName => self.person_name.as_deref(),
            CustomerField::Phone => self.mobile.as_deref(),
            CustomerField::Email => self.email.as_deref(),
            CustomerField::Address => self.address.as_deref(),
            CustomerField::WechatId => self.weixin_acc.as_deref(),
        };
        normalize_value(raw)
    }

    /// Numeric ERP id (`ord`), if present and well formed.
    pub fn erp_id(&self) -> Option<i64> {
        self.field_value(CustomerField::ErpCustomerId)
            .and_then(|v| v.parse::<i64>().ok())
    }

    pub fn customer_type(&self) -> i32 {
        normalize_value(self.intsort.as_deref())
            .and_then(|v| v.parse::<i32>().ok())
            .unwrap_or(1)
    }
}

fn loose_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}
