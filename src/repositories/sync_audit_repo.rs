use sqlx::types::Json;
use sqlx::{query, PgPool};

use crate::models::{FieldChange, SyncLogEntry};
use crate::services::erp::error::Result;

/// Append-only audit tables: field changes and sync decisions.
pub struct SyncAuditRepository {
    pool: PgPool,
}

impl SyncAuditRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Insert all rows in one transaction.
    pub async fn insert_field_changes(&self, changes: &[FieldChange]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for change in changes {
            query(
                r#"
                INSERT INTO customer_field_changes (
                    customer_id, field_name, old_value, new_value,
                    source, change_type, reason, created_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                "#,
            )
            .bind(change.customer_id)
            .bind(&change.field_name)
            .bind(&change.old_value)
            .bind(&change.new_value)
            .bind(&change.source)
            .bind(&change.change_type)
            .bind(&change.reason)
            .bind(change.created_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn insert_sync_log(&self, entry: &SyncLogEntry) -> Result<()> {
        query(
            r#"
            INSERT INTO erp_sync_logs (
                customer_id, sync_direction, sync_type, sync_action, sync_result,
                matched_rule, rule_confidence, rule_reason, erp_customer_id,
                changed_fields, field_count, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(entry.customer_id)
        .bind(entry.direction.as_str())
        .bind(&entry.sync_type)
        .bind(entry.action.map(|a| a.as_str()))
        .bind(&entry.result)
        .bind(&entry.matched_rule)
        .bind(entry.confidence)
        .bind(&entry.reason)
        .bind(entry.erp_customer_id)
        .bind(Json(&entry.changed_fields))
        .bind(entry.field_count)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
