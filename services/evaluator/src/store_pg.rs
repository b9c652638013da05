use async_trait::async_trait;
use replay::{StageStore, StoreError};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;

/// [`StageStore`] on the `stage_kv` table.
#[derive(Clone)]
pub struct PgStageStore {
    pool: PgPool,
}

impl PgStageStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn storage_err(e: sqlx::Error) -> StoreError {
    StoreError::Storage(e.to_string())
}

#[async_trait]
impl StageStore for PgStageStore {
    async fn get(&self, key: &str) -> replay::Result<Option<Value>> {
        let row: Option<Json<Value>> = sqlx::query_scalar("SELECT value FROM stage_kv WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|Json(v)| v))
    }

    async fn put(&self, key: &str, value: &Value) -> replay::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stage_kv (key, value, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()
            "#,
        )
        .bind(key)
        .bind(Json(value))
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> replay::Result<()> {
        sqlx::query("DELETE FROM stage_kv WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(())
    }
}
