use std::time::Duration;

use bson::Document;
use serde::{Deserialize, Serialize};

/// Watcher configuration (§4.4.1). `batch_size` and `batch_interval` are the
/// dual flush thresholds; the loop flushes on whichever fires first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamWatcherConfig {
    pub job_id: String,
    pub database: String,
    pub collection_name: String,
    pub batch_size: usize,
    pub batch_interval: Duration,
    pub max_retries: u32,
    pub retry_backoff_base: f64,
    pub max_retry_delay: Duration,
    /// Server-side max-await on the cursor; bounds cancellation responsiveness (§5).
    pub max_await_time: Duration,
    pub filter_pipeline: Option<Vec<Document>>,
    /// Consecutive checkpoint-save failures before escalating to a terminal
    /// error (§4.1, §9 open question — left configurable).
    pub checkpoint_failure_threshold: u32,
    /// Identity recorded as `applied_by` on any schema version this watcher registers.
    pub schema_applied_by: String,
    /// Sink table name schema evolution is tracked/registered under, if a
    /// schema evaluator is wired in.
    pub sink_table: Option<String>,
}

impl StreamWatcherConfig {
    pub fn new(job_id: impl Into<String>, database: impl Into<String>, collection_name: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            database: database.into(),
            collection_name: collection_name.into(),
            batch_size: 100,
            batch_interval: Duration::from_secs(10),
            max_retries: 5,
            retry_backoff_base: 2.0,
            max_retry_delay: Duration::from_secs(60),
            max_await_time: Duration::from_millis(1000),
            filter_pipeline: None,
            checkpoint_failure_threshold: 2,
            schema_applied_by: "cdc-worker".to_string(),
            sink_table: None,
        }
    }
}

impl From<&cdc_common::job::JobConfig> for StreamWatcherConfig {
    fn from(job: &cdc_common::job::JobConfig) -> Self {
        let mut config = Self::new(job.job_id.clone(), job.database.clone(), job.collection.clone());
        config.batch_size = job.batch_size as usize;
        config.batch_interval = Duration::from_secs(job.batch_interval_seconds);
        config.filter_pipeline = job.filter_pipeline.clone();
        config.sink_table = Some(job.sink_table.clone());
        config
    }
}
