use chrono::{DateTime, Utc};
use sqlx::{query, query_scalar, PgPool};

use crate::services::erp::error::Result;

pub struct SyncCheckpointRepository {
    pool: PgPool,
}

impl SyncCheckpointRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        let value = query_scalar::<_, DateTime<Utc>>(
            "SELECT checkpoint_value FROM erp_sync_checkpoints WHERE checkpoint_key = $1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value)
    }

    pub async fn set(&self, key: &str, value: DateTime<Utc>) -> Result<()> {
        query(
            r#"
            INSERT INTO erp_sync_checkpoints (checkpoint_key, checkpoint_value, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (checkpoint_key) DO UPDATE SET
                checkpoint_value = EXCLUDED.checkpoint_value,
                updated_at = NOW()
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
