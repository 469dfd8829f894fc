pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "mysql")]
pub mod mysql;

use async_trait::async_trait;
use cdc_common::job::{JobConfig, JobExecution, JobMetrics, JobResult, JobTrigger, JobType};

pub use error::{JobRegistryError, Result};

/// Per-job configuration and execution records (C6). Feeds C5 and is queried
/// by the out-of-scope control plane.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Idempotent on `job_id`; a second call with the same id is an
    /// integrity violation (§4.6).
    async fn create_job(&self, config: JobConfig) -> Result<String>;

    async fn get_job(&self, job_id: &str) -> Result<Option<JobConfig>>;

    async fn list_jobs(&self, user_id: Option<i64>, job_type: Option<JobType>) -> Result<Vec<JobConfig>>;

    async fn update_job(&self, job_id: &str, config: JobConfig) -> Result<()>;

    /// Cascades the job's execution rows (§4.6).
    async fn delete_job(&self, job_id: &str) -> Result<()>;

    /// Transitions the job to RUNNING, persists a new execution, returns its
    /// id. Refuses disabled jobs (§4.6).
    async fn start_job(&self, job_id: &str, triggered_by: JobTrigger) -> Result<String>;

    /// Writes terminal state exactly once; a second call on an
    /// already-terminal execution is a no-op rather than an overwrite.
    async fn complete_job(&self, execution_id: &str, result: JobResult) -> Result<()>;

    async fn get_job_executions(&self, job_id: &str, limit: i64) -> Result<Vec<JobExecution>>;

    /// Read-only aggregate over executions in the trailing `days` window
    /// (§4.6's aggregation detail). `None` when the window has zero
    /// executions.
    async fn get_job_metrics(&self, job_id: &str, days: u32) -> Result<Option<JobMetrics>>;
}

/// Shared aggregation over a set of already-fetched executions, used by every
/// backend's `get_job_metrics` so the arithmetic lives in one place (§4.6).
pub(crate) fn aggregate_metrics(
    job_id: &str,
    days: u32,
    executions: &[JobExecution],
) -> Option<JobMetrics> {
    use cdc_common::job::JobStatus;

    if executions.is_empty() {
        return None;
    }

    let total_executions = executions.len() as u64;
    let successful_executions = executions.iter().filter(|e| e.status == JobStatus::Success).count() as u64;
    let failed_executions = executions.iter().filter(|e| e.status == JobStatus::Failed).count() as u64;
    let cancelled_executions = executions.iter().filter(|e| e.status == JobStatus::Cancelled).count() as u64;

    let durations: Vec<f64> = executions
        .iter()
        .filter_map(|e| e.completed_at.map(|c| (c - e.started_at).num_milliseconds() as f64 / 1000.0))
        .collect();

    let average_duration_seconds = if durations.is_empty() {
        0.0
    } else {
        durations.iter().sum::<f64>() / durations.len() as f64
    };
    let min_duration_seconds = durations.iter().cloned().fold(f64::INFINITY, f64::min);
    let max_duration_seconds = durations.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let min_duration_seconds = if min_duration_seconds.is_finite() { min_duration_seconds } else { 0.0 };
    let max_duration_seconds = if max_duration_seconds.is_finite() { max_duration_seconds } else { 0.0 };

    let total_records_processed: i64 = executions
        .iter()
        .filter_map(|e| e.result.as_ref())
        .map(|r| r.records_processed)
        .sum();

    let average_records_per_second = if average_duration_seconds > 0.0 {
        total_records_processed as f64 / average_duration_seconds
    } else {
        0.0
    };

    let error_rate = failed_executions as f64 / total_executions as f64 * 100.0;

    let first_execution = executions.iter().map(|e| e.started_at).min();
    let last_execution = executions.iter().map(|e| e.started_at).max();
    let last_successful_execution = executions
        .iter()
        .filter(|e| e.status == JobStatus::Success)
        .map(|e| e.started_at)
        .max();

    Some(JobMetrics {
        job_id: job_id.to_string(),
        window_days: days,
        total_executions,
        successful_executions,
        failed_executions,
        cancelled_executions,
        average_duration_seconds,
        min_duration_seconds,
        max_duration_seconds,
        total_records_processed,
        average_records_per_second,
        error_rate,
        first_execution,
        last_execution,
        last_successful_execution,
    })
}
