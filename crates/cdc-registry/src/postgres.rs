use async_trait::async_trait;
use cdc_common::job::{
    JobConfig, JobExecution, JobMetrics, JobResult, JobRunState, JobStatus, JobTrigger, JobType,
};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::error::{JobRegistryError, Result};
use crate::{aggregate_metrics, JobRegistry};

pub struct PostgresJobRegistry {
    pool: PgPool,
}

impl PostgresJobRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cdc_jobs (
                job_id TEXT PRIMARY KEY,
                user_id BIGINT NOT NULL,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                config_json JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
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
                started_at TIMESTAMPTZ NOT NULL,
                completed_at TIMESTAMPTZ,
                triggered_by TEXT NOT NULL,
                job_config_json JSONB NOT NULL,
                result_json JSONB,
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

fn row_to_execution(row: &sqlx::postgres::PgRow) -> Result<JobExecution> {
    let job_config_json: serde_json::Value = row.get("job_config_json");
    let result_json: Option<serde_json::Value> = row.get("result_json");

    Ok(JobExecution {
        execution_id: row.get("execution_id"),
        job_id: row.get("job_id"),
        status: parse_job_status(row.get::<String, _>("status").as_str()),
        started_at: row.get("started_at"),
        completed_at: row.get("completed_at"),
        triggered_by: parse_trigger(row.get::<String, _>("triggered_by").as_str()),
        job_config: serde_json::from_value(job_config_json)
            .map_err(|e| JobRegistryError::Serialization(e.to_string()))?,
        result: result_json
            .map(serde_json::from_value)
            .transpose()
            .map_err(|e| JobRegistryError::Serialization(e.to_string()))?,
        retry_count: row.get::<i32, _>("retry_count") as u32,
        max_retries: row.get::<i32, _>("max_retries") as u32,
        worker_identity: row.get("worker_identity"),
    })
}

#[async_trait]
impl JobRegistry for PostgresJobRegistry {
    async fn create_job(&self, config: JobConfig) -> Result<String> {
        let config_json =
            serde_json::to_value(&config).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;

        sqlx::query(
            "INSERT INTO cdc_jobs (job_id, user_id, job_type, status, config_json, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(&config.job_id)
        .bind(config.user_id)
        .bind(job_type_str(JobType::Stream))
        .bind(job_status_str(if config.enabled { JobStatus::Pending } else { JobStatus::Paused }))
        .bind(&config_json)
        .bind(config.created_at)
        .bind(config.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if e.to_string().contains("duplicate key") {
                JobRegistryError::DuplicateJob(config.job_id.clone())
            } else {
                JobRegistryError::Database(e.to_string())
            }
        })?;

        Ok(config.job_id)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<JobConfig>> {
        let row = sqlx::query("SELECT config_json FROM cdc_jobs WHERE job_id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        row.map(|r| {
            let config_json: serde_json::Value = r.get("config_json");
            serde_json::from_value(config_json).map_err(|e| JobRegistryError::Serialization(e.to_string()))
        })
        .transpose()
    }

    async fn list_jobs(&self, user_id: Option<i64>, job_type: Option<JobType>) -> Result<Vec<JobConfig>> {
        let rows = sqlx::query(
            "SELECT config_json FROM cdc_jobs \
             WHERE ($1::BIGINT IS NULL OR user_id = $1) AND ($2::TEXT IS NULL OR job_type = $2) \
             ORDER BY created_at ASC",
        )
        .bind(user_id)
        .bind(job_type.map(job_type_str))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        rows.into_iter()
            .map(|r| {
                let config_json: serde_json::Value = r.get("config_json");
                serde_json::from_value(config_json).map_err(|e| JobRegistryError::Serialization(e.to_string()))
            })
            .collect()
    }

    async fn update_job(&self, job_id: &str, config: JobConfig) -> Result<()> {
        let config_json =
            serde_json::to_value(&config).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;

        let result = sqlx::query(
            "UPDATE cdc_jobs SET user_id = $1, config_json = $2, updated_at = $3 WHERE job_id = $4",
        )
        .bind(config.user_id)
        .bind(&config_json)
        .bind(Utc::now())
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

        sqlx::query("DELETE FROM cdc_job_executions WHERE job_id = $1")
            .bind(job_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        let result = sqlx::query("DELETE FROM cdc_jobs WHERE job_id = $1")
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

        if !config.enabled {
            return Err(JobRegistryError::JobDisabled(job_id.to_string()));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let job_config_json =
            serde_json::to_value(&config).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;
        let started_at = Utc::now();

        let mut tx = self.pool.begin().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        sqlx::query(
            "INSERT INTO cdc_job_executions \
             (execution_id, job_id, status, run_state, started_at, completed_at, triggered_by, \
              job_config_json, result_json, retry_count, max_retries, worker_identity) \
             VALUES ($1, $2, $3, $4, $5, NULL, $6, $7, NULL, 0, 0, NULL)",
        )
        .bind(&execution_id)
        .bind(job_id)
        .bind(job_status_str(JobStatus::Running))
        .bind(run_state_str(JobRunState::Running))
        .bind(started_at)
        .bind(trigger_str(triggered_by))
        .bind(&job_config_json)
        .execute(&mut *tx)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        sqlx::query("UPDATE cdc_jobs SET status = $1, updated_at = $2 WHERE job_id = $3")
            .bind(job_status_str(JobStatus::Running))
            .bind(started_at)
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
            serde_json::to_value(&result).map_err(|e| JobRegistryError::Serialization(e.to_string()))?;
        let completed_at = result.completed_at.unwrap_or_else(Utc::now);

        let mut tx = self.pool.begin().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;

        let update = sqlx::query(
            "UPDATE cdc_job_executions SET status = $1, run_state = $2, completed_at = $3, result_json = $4 \
             WHERE execution_id = $5 AND completed_at IS NULL",
        )
        .bind(job_status_str(result.status))
        .bind(run_state_str(run_state))
        .bind(completed_at)
        .bind(&result_json)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        if update.rows_affected() == 0 {
            let exists: Option<i32> = sqlx::query_scalar("SELECT 1 FROM cdc_job_executions WHERE execution_id = $1")
                .bind(execution_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(|e| JobRegistryError::Database(e.to_string()))?;
            if exists.is_none() {
                return Err(JobRegistryError::ExecutionNotFound(execution_id.to_string()));
            }
            tx.commit().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;
            return Ok(());
        }

        sqlx::query(
            "UPDATE cdc_jobs SET status = $1, updated_at = $2 \
             WHERE job_id = (SELECT job_id FROM cdc_job_executions WHERE execution_id = $3)",
        )
        .bind(job_status_str(result.status))
        .bind(completed_at)
        .bind(execution_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        tx.commit().await.map_err(|e| JobRegistryError::Database(e.to_string()))?;
        Ok(())
    }

    async fn get_job_executions(&self, job_id: &str, limit: i64) -> Result<Vec<JobExecution>> {
        let rows = sqlx::query(
            "SELECT * FROM cdc_job_executions WHERE job_id = $1 ORDER BY started_at DESC LIMIT $2",
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
        let rows = sqlx::query("SELECT * FROM cdc_job_executions WHERE job_id = $1 AND started_at >= $2")
            .bind(job_id)
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| JobRegistryError::Database(e.to_string()))?;

        let executions: Vec<JobExecution> = rows.iter().map(row_to_execution).collect::<Result<_>>()?;
        Ok(aggregate_metrics(job_id, days, &executions))
    }
}
