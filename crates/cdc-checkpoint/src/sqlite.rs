use async_trait::async_trait;
use cdc_common::{Checkpoint, ResumeToken};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{CheckpointError, Result};
use crate::CheckpointBackend;

pub struct SqliteCheckpointBackend {
    pool: SqlitePool,
}

impl SqliteCheckpointBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_checkpoints (
                job_id TEXT NOT NULL,
                collection_name TEXT NOT NULL,
                resume_token_json TEXT NOT NULL,
                last_event_time TEXT,
                records_processed INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
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
impl CheckpointBackend for SqliteCheckpointBackend {
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
        let now = Utc::now().to_rfc3339();
        let last_event_time = last_event_time.map(|t| t.to_rfc3339());

        // SQLite has no native row-level lock; the upsert is atomic within
        // the single statement, which is sufficient for the single-writer
        // rule this store assumes (§5).
        sqlx::query(
            r#"
            INSERT INTO cdc_checkpoints
                (job_id, collection_name, resume_token_json, last_event_time, records_processed, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_id, collection_name) DO UPDATE SET
                resume_token_json = excluded.resume_token_json,
                last_event_time = excluded.last_event_time,
                records_processed = excluded.records_processed,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(job_id)
        .bind(collection)
        .bind(&token_json)
        .bind(&last_event_time)
        .bind(records_processed)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| CheckpointError::Database(e.to_string()))?;

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
        parse_row(job_id, collection, row).map(Some)
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

fn parse_row(job_id: &str, collection: &str, row: sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
    let token_json: String = row.get("resume_token_json");
    let last_event_time: Option<String> = row.get("last_event_time");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    let resume_token: ResumeToken = match serde_json::from_str(&token_json) {
        Ok(t) => t,
        Err(e) => {
            tracing::warn!(job_id, collection, error = %e, "failed to deserialize stored resume token");
            return Err(CheckpointError::Serialization(e.to_string()));
        }
    };

    Ok(Checkpoint {
        job_id: job_id.to_string(),
        collection: collection.to_string(),
        resume_token,
        last_event_time: last_event_time
            .map(|t| DateTime::parse_from_rfc3339(&t).map(|dt| dt.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
        records_processed: row.get("records_processed"),
        created_at: DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
        updated_at: DateTime::parse_from_rfc3339(&updated_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use cdc_common::ResumeToken;

    async fn make_store() -> SqliteCheckpointBackend {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let backend = SqliteCheckpointBackend::new(pool);
        backend.init_schema().await.unwrap();
        backend
    }

    fn token(n: i32) -> ResumeToken {
        ResumeToken::new(doc! { "_data": format!("token-{n}") })
    }

    #[tokio::test]
    async fn upsert_then_fetch_round_trips() {
        let backend = make_store().await;
        backend
            .upsert("job-1", "orders", &token(1), Some(Utc::now()), 3)
            .await
            .unwrap();

        let checkpoint = backend.fetch("job-1", "orders").await.unwrap().unwrap();
        assert_eq!(checkpoint.resume_token, token(1));
        assert_eq!(checkpoint.records_processed, 3);
    }

    #[tokio::test]
    async fn upsert_overwrites_existing_row_for_same_key() {
        let backend = make_store().await;
        backend.upsert("job-1", "orders", &token(1), None, 3).await.unwrap();
        backend.upsert("job-1", "orders", &token(2), None, 7).await.unwrap();

        let checkpoint = backend.fetch("job-1", "orders").await.unwrap().unwrap();
        assert_eq!(checkpoint.resume_token, token(2));
        assert_eq!(checkpoint.records_processed, 7);
    }

    #[tokio::test]
    async fn fetch_missing_returns_none() {
        let backend = make_store().await;
        assert!(backend.fetch("job-1", "orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_deletes_the_row() {
        let backend = make_store().await;
        backend.upsert("job-1", "orders", &token(1), None, 1).await.unwrap();
        backend.remove("job-1", "orders").await.unwrap();
        assert!(backend.fetch("job-1", "orders").await.unwrap().is_none());
    }
}
