use async_trait::async_trait;
use cdc_common::{Checkpoint, ResumeToken};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{CheckpointError, Result};
use crate::CheckpointBackend;

pub struct PostgresCheckpointBackend {
    pool: PgPool,
}

impl PostgresCheckpointBackend {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_checkpoints (
                job_id TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                resume_token_json JSONB NOT NULL,
                last_event_time TIMESTAMPTZ,
                records_processed BIGINT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (job_id, collection_name)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointBackend for PostgresCheckpointBackend {
    async fn upsert(
        &self,
        job_id: &str,
        collection: &str,
        resume_token: &ResumeToken,
        last_event_time: Option<DateTime<Utc>>,
        records_processed: i64,
    ) -> Result<()> {
        let token_json = serde_json::to_value(resume_token)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CheckpointError::Database(e.to_string()))?;

        // Defensive row lock against an accidental second writer (§4.1); the
        // single-writer-per-job rule means this normally finds no contention.
        sqlx::query(
            "SELECT 1 FROM cdc_checkpoints WHERE job_id = $1 AND collection_name = $2 FOR UPDATE",
        )
        .bind(job_id)
        .bind(collection)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| CheckpointError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO cdc_checkpoints
                (job_id, collection_name, resume_token_json, last_event_time, records_processed, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $6)
            ON CONFLICT (job_id, collection_name) DO UPDATE SET
                resume_token_json = excluded.resume_token_json,
                last_event_time = excluded.last_event_time,
                records_processed = excluded.records_processed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(collection)
        .bind(&token_json)
        .bind(last_event_time)
        .bind(records_processed)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| CheckpointError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| CheckpointError::Database(e.to_string()))?;
        Ok(())
    }

    async fn fetch(&self, job_id: &str, collection: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            "SELECT resume_token_json, last_event_time, records_processed, created_at, updated_at \
             FROM cdc_checkpoints WHERE job_id = $1 AND collection_name = $2",
        )
        .bind(job_id)
        .bind(collection)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::Database(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };

        let token_json: serde_json::Value = row.get("resume_token_json");
        let resume_token: ResumeToken = match serde_json::from_value(token_json) {
            Ok(t) => t,
            Err(e) => {
                tracing::warn!(job_id, collection, error = %e, "failed to deserialize stored resume token");
                return Err(CheckpointError::Serialization(e.to_string()));
            }
        };

        Ok(Some(Checkpoint {
            job_id: job_id.to_string(),
            collection: collection.to_string(),
            resume_token,
            last_event_time: row.get("last_event_time"),
            records_processed: row.get("records_processed"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn remove(&self, job_id: &str, collection: &str) -> Result<()> {
        sqlx::query("DELETE FROM cdc_checkpoints WHERE job_id = $1 AND collection_name = $2")
            .bind(job_id)
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Database(e.to_string()))?;
        Ok(())
    }
}
