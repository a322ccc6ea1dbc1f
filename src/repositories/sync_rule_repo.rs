use sqlx::{query, query_as, PgPool};

use crate::models::SyncRuleRecord;
use crate::services::erp::error::Result;

#[derive(sqlx::FromRow)]
struct SyncRuleRow {
    id: i64,
    rule_name: String,
    rule_type: String,
    priority: i32,
    conditions: serde_json::Value,
    action: Option<String>,
    description: Option<String>,
    match_count: i64,
    is_active: bool,
}

impl From<SyncRuleRow> for SyncRuleRecord {
    fn from(row: SyncRuleRow) -> Self {
        Self {
            id: row.id,
            name: row.rule_name,
            rule_type: row.rule_type,
            priority: row.priority,
            conditions: row.conditions,
            action: row.action,
            description: row.description,
            match_count: row.match_count,
            is_active: row.is_active,
        }
    }
}

pub struct SyncRuleRepository {
    pool: PgPool,
}

impl SyncRuleRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn load_active(&self) -> Result<Vec<SyncRuleRecord>> {
        let rows = query_as::<_, SyncRuleRow>(
            r#"
            SELECT id, rule_name, rule_type, priority, conditions, action,
                   description, match_count, is_active
            FROM erp_sync_rules
            WHERE is_active = TRUE
            ORDER BY priority DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SyncRuleRecord::from).collect())
    }

    pub async fn increment_match_counts(&self, counts: &[(String, i64)]) -> Result<()> {
        if counts.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for (rule_name, delta) in counts {
            query(
                r#"
                UPDATE erp_sync_rules
                SET match_count = match_count + $2, updated_at = NOW()
                WHERE rule_name = $1
                "#,
            )
            .bind(rule_name)
            .bind(delta)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
