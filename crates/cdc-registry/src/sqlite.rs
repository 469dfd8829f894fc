use async_trait::async_trait;
use cdc_common::job::{
    JobConfig, JobExecution, JobMetrics, JobResult, JobRunState, JobStatus, JobTrigger, JobType,
};
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{JobRegistryError, Result};
use crate::{aggregate_metrics, JobRegistry};

pub struct SqliteJobRegistry {
    pool: SqlitePool,
}

impl SqliteJobRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_jobs (
                job_id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                config_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_job_executions (
                execution_id TEXT PRIMARY KEY,
                job_id TEXT NOT NULL,
                status TEXT NOT NULL,
                run_state TEXT NOT NULL,
                started_at TEXT NOT NULL,
                completed_at TEXT,
                triggered_by TEXT NOT NULL,
                job_config_json TEXT NOT NULL,
                result_json TEXT,
                retry_count INTEGER NOT NULL,
                max_retries INTEGER NOT NULL,
                worker_identity TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        Ok(())
    }
}

fn job_status_str(s: JobStatus) -> &'static str {
    match s {
        JobStatus::Pending => "PENDING",
        JobStatus::Running => "RUNNING",
        JobStatus::Success => "SUCCESS",
        JobStatus::Failed => "FAILED",
        JobStatus::Cancelled => "CANCELLED",
        JobStatus::Paused => "PAUSED",
    }
}

fn parse_job_status(s: &str) -> JobStatus {
    match s {
        "RUNNING" => JobStatus::Running,
        "SUCCESS" => JobStatus::Success,
        "FAILED" => JobStatus::Failed,
        "CANCELLED" => JobStatus::Cancelled,
        "PAUSED" => JobStatus::Paused,
        _ => JobStatus::Pending,
    }
}

fn job_type_str(t: JobType) -> &'static str {
    match t {
        JobType::Batch => "batch",
        JobType::Stream => "stream",
    }
}

fn run_state_str(s: JobRunState) -> &'static str {
    match s {
        JobRunState::Received => "RECEIVED",
        JobRunState::Validated => "VALIDATED",
        JobRunState::Running => "RUNNING",
        JobRunState::Finished => "FINISHED",
        JobRunState::Failed => "FAILED",
        JobRunState::ValidationFailed => "VALIDATION_FAILED",
    }
}

fn trigger_str(t: JobTrigger) -> &'static str {
    match t {
        JobTrigger::Manual => "manual",
        JobTrigger::Scheduled => "scheduled",
        JobTrigger::Event => "event",
        JobTrigger::Api => "api",
        JobTrigger::Backfill => "backfill",
        JobTrigger::Incremental => "incremental",
    }
}

fn parse_trigger(s: &str) -> JobTrigger {
    match s {
        "scheduled" => JobTrigger::Scheduled,
        "event" => JobTrigger::Event,
        "api" => JobTrigger::Api,
        "backfill" => JobTrigger::Backfill,
        "incremental" => JobTrigger::Incremental,
        _ => JobTrigger::Manual,
    }
}

fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> Result<JobExecution> {
    let job_config_json: String = row.get("job_config_json");
    let result_json: Option<String> = row.get("result_json");
    let started_at: String = row.get("started_at");
    let completed_at: Option<String> = row.get("completed_at");

    Ok(JobExecution {
        execution_id: row.get("execution_id"),
        job_id: row.get("job_id"),
        status: parse_job_status(row.get::<String, _>("status").as_str()),
        started_at: DateTime::parse_from_rfc3339(&started_at)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(|e| JobRegistryError::Serialization(e.to_string()))?,
        completed_at: completed_at
            .map(|c| {
                DateTime::parse_from_rfc3339(&c)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| JobRegistryError::Serialization(e.to_string()))
            })
            .transpose()?,
        triggered_by: parse_trigger(row.get::<String, _>("triggered_by").as_str()),
        job_config: serde_json::from_str(&job_config_json)
            .map_err(|e| JobRegistryError::Serialization(e.to_string()))?,
        result: result_json
            .map(|r| serde_json::from_str(&r).map_err(|e| JobRegistryError::Serialization(e.to_string())))
            .transpose()?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        worker_identity: row.get("worker_identity"),
    })
}

#[async_trait]
impl JobRegistry for SqliteJobRegistry {
    async fn create_job(&self, config: JobConfig) -> Result<String> {
        let config_json =
            serde_json::to_string(&config).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO cdc_jobs (job_id, user_id, job_type, status, config_json, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&config.job_id)
        .bind(config.user_id)
        .bind(job_type_str(JobType::Stream))
        .bind(job_status_str(if config.enabled { JobStatus::Pending } else { JobStatus::Paused }))
        .bind(&config_json)
        .bind(config.created_at.to_rfc3339())
        .bind(config.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("UNIQUE") {
                JobRegistryError::DuplicateJob(config.job_id.clone())
            } else {
                JobRegistryError::Database(e.to_string())
            }
        })?;

        Ok(config.job_id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobConfig>> {
        let row = sqlx::query("SELECT config_json FROM cdc_jobs WHERE job_id = ?")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        row.map(|r| {
            let config_json: String = r.get("config_json");
            serde_json::from_str(&config_json).map_err(|e| JobRegistryError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn list_jobs(&self, user_id: Option<i64>, job_type: Option<JobType>) -> Result<Vec<JobConfig>> {
        let rows = sqlx::query(
            "SELECT config_json FROM cdc_jobs \
             WHERE (?1 IS NULL OR user_id = ?1) AND (?2 IS NULL OR job_type = ?2) \
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(job_type.map(job_type_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|r| {
                let config_json: String = r.get("config_json");
                serde_json::from_str(&config_json).map_err(|e| JobRegistryError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn update_job(&self, job_id: &str, config: JobConfig) -> Result<()> {
        let config_json =
            serde_json::to_string(&config).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE cdc_jobs SET user_id = ?, config_json = ?, updated_at = ? WHERE job_id = ?",
        )
        .bind(config.user_id)
        .bind(&config_json)
        .bind(Utc::now().to_rfc3339())
        .bind(job_id)
        .execute(&self.pool)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(JobRegistryError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn delete_job(&self, job_id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM cdc_job_executions WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        let result = sqlx::query("DELETE FROM cdc_jobs WHERE job_id = ?")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(JobRegistryError::JobNotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn start_job(&self, job_id: &str, triggered_by: JobTrigger) -> Result<String> {
        let config = self
            .get_job(job_id)
            .await?
            .ok_or_else(|| JobRegistryError::JobNotFound(job_id.to_string()))?;

        tracing::debug!(job_id, "execution received");
        if !config.enabled {
            tracing::debug!(job_id, "execution validation failed: job disabled");
            return Err(JobRegistryError::JobDisabled(job_id.to_string()));
        }
        tracing::debug!(job_id, "execution validated");

        let execution_id = uuid::Uuid::new_v4().to_string();
        let job_config_json =
            serde_json::to_string(&config).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;
        let started_at = Utc::now();

        let mut tx = self.pool.begin().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO cdc_job_executions \
             (execution_id, job_id, status, run_state, started_at, completed_at, triggered_by, \
              job_config_json, result_json, retry_count, max_retries, worker_identity) \
             VALUES (?, ?, ?, ?, ?, NULL, ?, ?, NULL, 0, 0, NULL)",
        )
        .bind(&execution_id)
        .bind(job_id)
        .bind(job_status_str(JobStatus::Running))
        .bind(run_state_str(JobRunState::Running))
        .bind(started_at.to_rfc3339())
        .bind(trigger_str(triggered_by))
        .bind(&job_config_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        sqlx::query("UPDATE cdc_jobs SET status = ?, updated_at = ? WHERE job_id = ?")
            .bind(job_status_str(JobStatus::Running))
            .bind(started_at.to_rfc3339())
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        tracing::info!(job_id, execution_id, "stream job started");
        Ok(execution_id)
    }

    async fn complete_job(&self, execution_id: &str, result: JobResult) -> Result<()> {
        let run_state = if result.status == JobStatus::Success {
            JobRunState::Finished
        } else {
            JobRunState::Failed
        };
        let result_json =
            serde_json::to_string(&result).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;
        let completed_at = result.completed_at.unwrap_or_else(Utc::now);

        let mut tx = self.pool.begin().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        let update = sqlx::query(
            "UPDATE cdc_job_executions SET status = ?, run_state = ?, completed_at = ?, result_json = ? \
             WHERE execution_id = ? AND completed_at IS NULL",
        )
        .bind(job_status_str(result.status))
        .bind(run_state_str(run_state))
        .bind(completed_at.to_rfc3339())
        .bind(&result_json)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        if update.rows_affected() == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM cdc_job_executions WHERE execution_id = ?")
                .bind(execution_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| JobRegistryError::Database(e.to_string()))?;
            if exists.is_none() {
                return Err(JobRegistryError::ExecutionNotFound(execution_id.to_string()));
            }
            // Already terminal: complete_job is a no-op on a second call (§4.6).
            tx.commit().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;
            return Ok(());
        }

        sqlx::query("UPDATE cdc_jobs SET status = ?, updated_at = ? WHERE job_id = (SELECT job_id FROM cdc_job_executions WHERE execution_id = ?)")
            .bind(job_status_str(result.status))
            .bind(completed_at.to_rfc3339())
            .bind(execution_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_job_executions(&self, job_id: &str, limit: i64) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM cdc_job_executions WHERE job_id = ? ORDER BY started_at DESC LIMIT ?",
        )
        .bind(job_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        rows.iter().map(row_to_execution).collect()
    }

    async fn get_job_metrics(&self, job_id: &str, days: u32) -> Result<Option<JobMetrics>> {
        let since = Utc::now() - chrono::Duration::days(days as i64);
        let rows = sqlx::query("SELECT * FROM cdc_job_executions WHERE job_id = ? AND started_at >= ?")
            .bind(job_id)
            .bind(since.to_rfc3339())
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        let executions: Vec<JobExecution> = rows.iter().map(row_to_execution).collect::<Result<_>>()?;
        Ok(aggregate_metrics(job_id, days, &executions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn make_registry() -> SqliteJobRegistry {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let registry = SqliteJobRegistry::new(pool);
        registry.init_schema().await.unwrap();
        registry
    }

    fn sample_job(job_id: &str, enabled: bool) -> JobConfig {
        let now = Utc::now();
        JobConfig {
            job_id: job_id.to_string(),
            job_name: "orders-sync".to_string(),
            user_id: 7,
            source_uri: "mongodb://127.0.0.1:27017".to_string(),
            database: "shop".to_string(),
            collection: "orders".to_string(),
            filter_pipeline: None,
            sink_table: "orders".to_string(),
            sink_base_path: "s3://bucket/orders".to_string(),
            batch_size: 100,
            batch_interval_seconds: 10,
            enabled,
            description: None,
            created_at: now,
            updated_at: now,
            created_by: "tester".to_string(),
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let registry = make_registry().await;
        let job = sample_job("job-1", true);
        registry.create_job(job.clone()).await.unwrap();

        let fetched = registry.get_job("job-1").await.unwrap().unwrap();
        assert_eq!(fetched.job_id, "job-1");
        assert!(registry.get_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_job_id_is_rejected() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", true)).await.unwrap();

        let err = registry.create_job(sample_job("job-1", true)).await.unwrap_err();
        assert!(matches!(err, JobRegistryError::DuplicateJob(id) if id == "job-1"));
    }

    #[tokio::test]
    async fn start_job_refuses_disabled_jobs() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", false)).await.unwrap();

        let err = registry.start_job("job-1", JobTrigger::Manual).await.unwrap_err();
        assert!(matches!(err, JobRegistryError::JobDisabled(_)));
    }

    #[tokio::test]
    async fn start_then_complete_records_terminal_state() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", true)).await.unwrap();

        let execution_id = registry.start_job("job-1", JobTrigger::Manual).await.unwrap();
        let executions = registry.get_job_executions("job-1", 10).await.unwrap();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, JobStatus::Running);

        let result = JobResult {
            job_id: "job-1".to_string(),
            execution_id: execution_id.clone(),
            status: JobStatus::Success,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            records_processed: 42,
            error_message: None,
            error_kind: None,
        };
        registry.complete_job(&execution_id, result).await.unwrap();

        let executions = registry.get_job_executions("job-1", 10).await.unwrap();
        assert_eq!(executions[0].status, JobStatus::Success);
        assert!(executions[0].completed_at.is_some());
    }

    #[tokio::test]
    async fn complete_job_is_idempotent_on_a_terminal_execution() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", true)).await.unwrap();
        let execution_id = registry.start_job("job-1", JobTrigger::Manual).await.unwrap();

        let make_result = |status| JobResult {
            job_id: "job-1".to_string(),
            execution_id: execution_id.clone(),
            status,
            started_at: Utc::now(),
            completed_at: Some(Utc::now()),
            records_processed: 10,
            error_message: None,
            error_kind: None,
        };

        registry.complete_job(&execution_id, make_result(JobStatus::Success)).await.unwrap();
        // A second, conflicting completion must not overwrite the first.
        registry.complete_job(&execution_id, make_result(JobStatus::Failed)).await.unwrap();

        let executions = registry.get_job_executions("job-1", 10).await.unwrap();
        assert_eq!(executions[0].status, JobStatus::Success);
    }

    #[tokio::test]
    async fn delete_job_cascades_executions() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", true)).await.unwrap();
        registry.start_job("job-1", JobTrigger::Manual).await.unwrap();

        registry.delete_job("job-1").await.unwrap();

        assert!(registry.get_job("job-1").await.unwrap().is_none());
        assert!(registry.get_job_executions("job-1", 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn metrics_return_none_for_a_job_with_no_executions() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", true)).await.unwrap();

        assert!(registry.get_job_metrics("job-1", 30).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn metrics_aggregate_over_completed_executions() {
        let registry = make_registry().await;
        registry.create_job(sample_job("job-1", true)).await.unwrap();

        for _ in 0..2 {
            let execution_id = registry.start_job("job-1", JobTrigger::Manual).await.unwrap();
            let result = JobResult {
                job_id: "job-1".to_string(),
                execution_id: execution_id.clone(),
                status: JobStatus::Success,
                started_at: Utc::now(),
                completed_at: Some(Utc::now()),
                records_processed: 100,
                error_message: None,
                error_kind: None,
            };
            registry.complete_job(&execution_id, result).await.unwrap();
        }

        let metrics = registry.get_job_metrics("job-1", 30).await.unwrap().unwrap();
        assert_eq!(metrics.total_executions, 2);
        assert_eq!(metrics.successful_executions, 2);
        assert_eq!(metrics.error_rate, 0.0);
        assert_eq!(metrics.total_records_processed, 200);
    }
}
