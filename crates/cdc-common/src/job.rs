use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Batch jobs are out of scope for this core; the registry still needs to
/// tell the two apart since it shares its tables with the batch supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobType {
    Batch,
    Stream,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
    Paused,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobTrigger {
    Manual,
    Scheduled,
    Event,
    Api,
    Backfill,
    Incremental,
}

/// The job-run state machine persisted alongside each execution record (§4.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobRunState {
    Received,
    Validated,
    Running,
    Finished,
    Failed,
    ValidationFailed,
}

/// Stream-job configuration (§3's `JobConfig`, stream variant). Batch jobs are
/// out of scope; the supervisor shape is shared but this core only persists
/// and runs the stream variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    pub job_name: String,
    pub user_id: i64,
    pub source_uri: String,
    pub database: String,
    pub collection: String,
    pub filter_pipeline: Option<Vec<bson::Document>>,
    pub sink_table: String,
    pub sink_base_path: String,
    pub batch_size: u32,
    pub batch_interval_seconds: u64,
    pub enabled: bool,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub execution_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub records_processed: i64,
    pub error_message: Option<String>,
    pub error_kind: Option<String>,
}

/// One execution of a job (§3's `JobExecution`, extended with the config
/// snapshot and worker identity the registry persists per §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobExecution {
    pub execution_id: String,
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub triggered_by: JobTrigger,
    pub job_config: JobConfig,
    pub result: Option<JobResult>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub worker_identity: Option<String>,
}

/// Read-only aggregate over a job's executions within a time window (§4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMetrics {
    pub job_id: String,
    pub window_days: u32,
    pub total_executions: u64,
    pub successful_executions: u64,
    pub failed_executions: u64,
    pub cancelled_executions: u64,
    pub average_duration_seconds: f64,
    pub min_duration_seconds: f64,
    pub max_duration_seconds: f64,
    pub total_records_processed: i64,
    pub average_records_per_second: f64,
    pub error_rate: f64,
    pub first_execution: Option<DateTime<Utc>>,
    pub last_execution: Option<DateTime<Utc>>,
    pub last_successful_execution: Option<DateTime<Utc>>,
}
