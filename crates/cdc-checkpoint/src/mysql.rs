use async_trait::async_trait;
use cdc_common::{Checkpoint, ResumeToken};
use chrono::{DateTime, Utc};
use sqlx::{MySqlPool, Row};

use crate::error::{CheckpointError, Result};
use crate::CheckpointBackend;

pub struct MySqlCheckpointBackend {
    pool: MySqlPool,
}

impl MySqlCheckpointBackend {
    pub fn new(pool: MySqlPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_checkpoints (
                job_id VARCHAR(255) NOT NULL,
                collection_name VARCHAR(255) NOT NULL,
                resume_token_json JSON NOT NULL,
                last_event_time DATETIME,
                records_processed BIGINT NOT NULL,
                created_at DATETIME NOT NULL,
                updated_at DATETIME NOT NULL,
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
impl CheckpointBackend for MySqlCheckpointBackend {
    async fn upsert(
        &self,
        job_id: &str,
        collection: &str,
        resume_token: &ResumeToken,
        last_event_time: Option<DateTime<Utc>>,
        records_processed: i64,
    ) -> Result<()> {
        let token_json = serde_json::to_string(resume_token)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        let now = Utc::now();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| CheckpointError::Database(e.to_string()))?;

        sqlx::query(
            "SELECT 1 FROM cdc_checkpoints WHERE job_id = ? AND collection_name = ? FOR UPDATE",
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
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON DUPLICATE KEY UPDATE
                resume_token_json = VALUES(resume_token_json),
                last_event_time = VALUES(last_event_time),
                records_processed = VALUES(records_processed),
                updated_at = VALUES(updated_at)
            "#,
        )
        .bind(job_id)
        .bind(collection)
        .bind(&token_json)
        .bind(last_event_time)
        .bind(records_processed)
        .bind(now)
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
             FROM cdc_checkpoints WHERE job_id = ? AND collection_name = ?",
        )
        .bind(job_id)
        .bind(collection)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| CheckpointError::Database(e.to_string()))?;

        let Some(row) = row else { return Ok(None) };

        let token_json: String = row.get("resume_token_json");
        let resume_token: ResumeToken = match serde_json::from_str(&token_json) {
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
        sqlx::query("DELETE FROM cdc_checkpoints WHERE job_id = ? AND collection_name = ?")
            .bind(job_id)
            .bind(collection)
            .execute(&self.pool)
            .await
            .map_err(|e| CheckpointError::Database(e.to_string()))?;
        Ok(())
    }
}
