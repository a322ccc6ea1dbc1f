use std::collections::BTreeMap;
use std::str::FromStr;

use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{query, query_as, FromRow, PgPool, Row};

use crate::models::{CustomerRecord, PushStateUpdate, SyncAction, SyncStatus, ValueSource};
use crate::services::erp::error::Result;

const CUSTOMER_COLUMNS: &str = r#"
    id, phone, phone_source, phone_verified,
    company_name, company_name_source, company_name_verified,
    real_name, real_name_source, real_name_verified,
    email, email_source, address, address_source,
    wechat_id, wechat_nickname, business_license_path, business_license_verified,
    erp_customer_id, erp_customer_code, erp_customer_type,
    intent_score, message_count, conversation_days, data_quality_score,
    has_order, has_contract, has_payment, has_quote_request,
    marked_as_important, marked_as_invalid,
    erp_sync_status, erp_sync_action, erp_sync_rule, erp_sync_confidence, erp_sync_error,
    erp_last_pulled_at, erp_last_pushed_at, local_updated_at, erp_updated_at,
    erp_known_values
"#;

fn decode_enum<T>(row: &PgRow, column: &str) -> std::result::Result<Option<T>, sqlx::Error>
where
    T: FromStr<Err = String>,
{
    let raw: Option<String> = row.try_get(column)?;
    raw.map(|value| {
        T::from_str(&value).map_err(|e| sqlx::Error::ColumnDecode {
            index: column.to_string(),
            source: e.into(),
        })
    })
    .transpose()
}

impl<'r> FromRow<'r, PgRow> for CustomerRecord {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let known: Json<BTreeMap<String, String>> = row.try_get("erp_known_values")?;

        Ok(Self {
            id: row.try_get("id")?,
            phone: row.try_get("phone")?,
            phone_source: decode_enum::<ValueSource>(row, "phone_source")?,
            phone_verified: row.try_get("phone_verified")?,
            company_name: row.try_get("company_name")?,
            company_name_source: decode_enum::<ValueSource>(row, "company_name_source")?,
            company_name_verified: row.try_get("company_name_verified")?,
            real_name: row.try_get("real_name")?,
            real_name_source: decode_enum::<ValueSource>(row, "real_name_source")?,
            real_name_verified: row.try_get("real_name_verified")?,
            email: row.try_get("email")?,
            email_source: decode_enum::<ValueSource>(row, "email_source")?,
            address: row.try_get("address")?,
            address_source: decode_enum::<ValueSource>(row, "address_source")?,
            wechat_id: row.try_get("wechat_id")?,
            wechat_nickname: row.try_get("wechat_nickname")?,
            business_license_path: row.try_get("business_license_path")?,
            business_license_verified: row.try_get("business_license_verified")?,
            erp_customer_id: row.try_get("erp_customer_id")?,
            erp_customer_code: row.try_get("erp_customer_code")?,
            erp_customer_type: row.try_get("erp_customer_type")?,
            intent_score: row.try_get("intent_score")?,
            message_count: row.try_get("message_count")?,
            conversation_days: row.try_get("conversation_days")?,
            data_quality_score: row.try_get("data_quality_score")?,
            has_order: row.try_get("has_order")?,
            has_contract: row.try_get("has_contract")?,
            has_payment: row.try_get("has_payment")?,
            has_quote_request: row.try_get("has_quote_request")?,
            marked_as_important: row.try_get("marked_as_important")?,
            marked_as_invalid: row.try_get("marked_as_invalid")?,
            erp_sync_status: decode_enum::<SyncStatus>(row, "erp_sync_status")?.unwrap_or_default(),
            erp_sync_action: decode_enum::<SyncAction>(row, "erp_sync_action")?,
            erp_sync_rule: row.try_get("erp_sync_rule")?,
            erp_sync_confidence: row.try_get("erp_sync_confidence")?,
            erp_sync_error: row.try_get("erp_sync_error")?,
            erp_last_pulled_at: row.try_get("erp_last_pulled_at")?,
            erp_last_pushed_at: row.try_get("erp_last_pushed_at")?,
            local_updated_at: row.try_get("local_updated_at")?,
            erp_updated_at: row.try_get("erp_updated_at")?,
            erp_known_values: known.0,
        })
    }
}

pub struct CustomerRepository {
    pool: PgPool,
}

impl CustomerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn find_by_id(&self, id: i64) -> Result<Option<CustomerRecord>> {
        let sql = format!("SELECT {} FROM customers_unified WHERE id = $1", CUSTOMER_COLUMNS);
        let record = query_as::<_, CustomerRecord>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    pub async fn find_by_erp_id(&self, erp_id: i64) -> Result<Option<CustomerRecord>> {
        let sql = format!(
            "SELECT {} FROM customers_unified WHERE erp_customer_id = $1",
            CUSTOMER_COLUMNS
        );
        let record = query_as::<_, CustomerRecord>(&sql)
            .bind(erp_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    /// Oldest customer with this phone number.
    pub async fn find_by_phone(&self, phone: &str) -> Result<Option<CustomerRecord>> {
        let sql = format!(
            "SELECT {} FROM customers_unified WHERE phone = $1 ORDER BY id ASC LIMIT 1",
            CUSTOMER_COLUMNS
        );
        let record = query_as::<_, CustomerRecord>(&sql)
            .bind(phone)
            .fetch_optional(&self.pool)
            .await?;

        Ok(record)
    }

    pub async fn insert(&self, c: &CustomerRecord) -> Result<i64> {
        let row = query(
            r#"
            INSERT INTO customers_unified (
                phone, phone_source, phone_verified,
                company_name, company_name_source, company_name_verified,
                real_name, real_name_source, real_name_verified,
                email, email_source, address, address_source,
                wechat_id, wechat_nickname, business_license_path, business_license_verified,
                erp_customer_id, erp_customer_code, erp_customer_type,
                intent_score, message_count, conversation_days, data_quality_score,
                has_order, has_contract, has_payment, has_quote_request,
                marked_as_important, marked_as_invalid,
                erp_sync_status, erp_sync_action, erp_sync_rule, erp_sync_confidence, erp_sync_error,
                erp_last_pulled_at, erp_last_pushed_at, local_updated_at, erp_updated_at,
                erp_known_values
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                $21, $22, $23, $24, $25, $26, $27, $28, $29, $30,
                $31, $32, $33, $34, $35, $36, $37, $38, $39, $40
            )
            RETURNING id
            "#,
        )
        .bind(&c.phone)
        .bind(c.phone_source.map(|s| s.as_str()))
        .bind(c.phone_verified)
        .bind(&c.company_name)
        .bind(c.company_name_source.map(|s| s.as_str()))
        .bind(c.company_name_verified)
        .bind(&c.real_name)
        .bind(c.real_name_source.map(|s| s.as_str()))
        .bind(c.real_name_verified)
        .bind(&c.email)
        .bind(c.email_source.map(|s| s.as_str()))
        .bind(&c.address)
        .bind(c.address_source.map(|s| s.as_str()))
        .bind(&c.wechat_id)
        .bind(&c.wechat_nickname)
        .bind(&c.business_license_path)
        .bind(c.business_license_verified)
        .bind(c.erp_customer_id)
        .bind(&c.erp_customer_code)
        .bind(c.erp_customer_type)
        .bind(c.intent_score)
        .bind(c.message_count)
        .bind(c.conversation_days)
        .bind(c.data_quality_score)
        .bind(c.has_order)
        .bind(c.has_contract)
        .bind(c.has_payment)
        .bind(c.has_quote_request)
        .bind(c.marked_as_important)
        .bind(c.marked_as_invalid)
        .bind(c.erp_sync_status.as_str())
        .bind(c.erp_sync_action.map(|a| a.as_str()))
        .bind(&c.erp_sync_rule)
        .bind(c.erp_sync_confidence)
        .bind(&c.erp_sync_error)
        .bind(c.erp_last_pulled_at)
        .bind(c.erp_last_pushed_at)
        .bind(c.local_updated_at)
        .bind(c.erp_updated_at)
        .bind(Json(&c.erp_known_values))
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get::<i64, _>("id")?)
    }

    /// Write back the columns a pull owns. Push state, engagement metrics,
    /// business flags and verification evidence belong to other writers and
    /// are left untouched; `erp_customer_id` can only go from NULL to a value.
    pub async fn update(&self, c: &CustomerRecord) -> Result<()> {
        query(
            r#"
            UPDATE customers_unified SET
                phone = $2, phone_source = $3,
                company_name = $4, company_name_source = $5,
                real_name = $6, real_name_source = $7,
                email = $8, email_source = $9,
                address = $10, address_source = $11,
                wechat_id = $12,
                erp_customer_id = COALESCE(erp_customer_id, $13),
                erp_customer_code = $14,
                erp_customer_type = $15,
                data_quality_score = $16,
                erp_last_pulled_at = $17,
                erp_updated_at = $18,
                erp_known_values = $19,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(c.id)
        .bind(&c.phone)
        .bind(c.phone_source.map(|s| s.as_str()))
        .bind(&c.company_name)
        .bind(c.company_name_source.map(|s| s.as_str()))
        .bind(&c.real_name)
        .bind(c.real_name_source.map(|s| s.as_str()))
        .bind(&c.email)
        .bind(c.email_source.map(|s| s.as_str()))
        .bind(&c.address)
        .bind(c.address_source.map(|s| s.as_str()))
        .bind(&c.wechat_id)
        .bind(c.erp_customer_id)
        .bind(&c.erp_customer_code)
        .bind(c.erp_customer_type)
        .bind(c.data_quality_score)
        .bind(c.erp_last_pulled_at)
        .bind(c.erp_updated_at)
        .bind(Json(&c.erp_known_values))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Record a push outcome. Touches only push-owned columns, merging the
    /// values just sent into `erp_known_values`.
    pub async fn update_push_state(&self, u: &PushStateUpdate) -> Result<()> {
        query(
            r#"
            UPDATE customers_unified SET
                erp_customer_id = COALESCE(erp_customer_id, $2),
                erp_sync_status = $3,
                erp_sync_action = $4,
                erp_sync_rule = $5,
                erp_sync_confidence = $6,
                erp_sync_error = $7,
                erp_last_pushed_at = COALESCE($8, erp_last_pushed_at),
                erp_known_values = erp_known_values || $9,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(u.customer_id)
        .bind(u.erp_customer_id)
        .bind(u.status.as_str())
        .bind(u.action.map(|a| a.as_str()))
        .bind(&u.rule)
        .bind(u.confidence)
        .bind(&u.error)
        .bind(u.pushed_at)
        .bind(Json(&u.sent_values))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn push_candidates(&self, limit: u32) -> Result<Vec<CustomerRecord>> {
        let sql = format!(
            r#"
            SELECT {} FROM customers_unified
            WHERE erp_sync_status IN ('pending', 'failed')
              AND marked_as_invalid = FALSE
            ORDER BY
                CASE WHEN has_order OR has_contract OR has_payment THEN 0 ELSE 1 END,
                data_quality_score DESC,
                id ASC
            LIMIT $1
            "#,
            CUSTOMER_COLUMNS
        );

        let records = query_as::<_, CustomerRecord>(&sql)
            .bind(limit as i64)
            .fetch_all(&self.pool)
            .await?;

        Ok(records)
    }
}
