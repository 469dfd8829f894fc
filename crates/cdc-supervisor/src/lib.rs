//! Per-job watcher lifecycle, process-wide signal handling (C5).

pub mod error;
pub mod sink_factory;
pub mod supervisor;

pub use error::{Result, SupervisorError};
pub use sink_factory::SinkFactory;
pub use supervisor::{StreamJobStatus, StreamJobSupervisor};

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use cdc_checkpoint::CheckpointStore;
    use cdc_common::{ChangeEvent, Checkpoint, ResumeToken};
    use cdc_stream::SinkCallback;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct NoopCheckpointStore;

    #[async_trait]
    impl CheckpointStore for NoopCheckpointStore {
        async fn save_checkpoint(
            &self,
            _job_id: &str,
            _collection: &str,
            _resume_token: ResumeToken,
            _last_event_time: Option<DateTime<Utc>>,
            _records_processed: i64,
        ) -> cdc_checkpoint::Result<()> {
            Ok(())
        }

        async fn load_checkpoint(&self, _job_id: &str, _collection: &str) -> cdc_checkpoint::Result<Option<ResumeToken>> {
            Ok(None)
        }

        async fn delete_checkpoint(&self, _job_id: &str, _collection: &str) -> cdc_checkpoint::Result<()> {
            Ok(())
        }

        async fn load_checkpoint_state(&self, _job_id: &str, _collection: &str) -> cdc_checkpoint::Result<Option<Checkpoint>> {
            Ok(None)
        }
    }

    struct RecordingSink {
        calls: AtomicU32,
    }

    #[async_trait]
    impl SinkCallback for RecordingSink {
        async fn call(&self, _batch: &[ChangeEvent]) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct TestSinkFactory;

    impl SinkFactory for TestSinkFactory {
        fn build_sink(&self, _job: &cdc_common::JobConfig) -> Arc<dyn SinkCallback> {
            Arc::new(RecordingSink { calls: AtomicU32::new(0) })
        }
    }

    fn test_job(job_id: &str) -> cdc_common::JobConfig {
        let now = Utc::now();
        cdc_common::JobConfig {
            job_id: job_id.to_string(),
            job_name: "orders-sync".to_string(),
            user_id: 1,
            source_uri: "mongodb://127.0.0.1:27017".to_string(),
            database: "testdb".to_string(),
            collection: "orders".to_string(),
            filter_pipeline: None,
            sink_table: "orders".to_string(),
            sink_base_path: "s3://bucket/orders".to_string(),
            batch_size: 100,
            batch_interval_seconds: 10,
            enabled: true,
            description: None,
            created_at: now,
            updated_at: now,
            created_by: "test".to_string(),
        }
    }

    async fn make_supervisor() -> Arc<StreamJobSupervisor> {
        let client = mongodb::Client::with_uri_str("mongodb://127.0.0.1:27017").await.unwrap();
        StreamJobSupervisor::new(client, Arc::new(NoopCheckpointStore), None, Arc::new(TestSinkFactory))
    }

    #[tokio::test]
    async fn starting_the_same_job_twice_is_rejected() {
        let supervisor = make_supervisor().await;
        let execution_id = supervisor.start_stream_job(test_job("job-1")).unwrap();

        let err = supervisor.start_stream_job(test_job("job-1")).unwrap_err();
        assert!(matches!(err, SupervisorError::AlreadyRunning(id) if id == execution_id));

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn status_reflects_a_freshly_started_job() {
        let supervisor = make_supervisor().await;
        let execution_id = supervisor.start_stream_job(test_job("job-2")).unwrap();

        let status = supervisor.get_stream_job_status(&execution_id).unwrap();
        assert_eq!(status.job_id, "job-2");
        assert!(status.is_running);

        supervisor.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn stopping_an_unknown_execution_returns_not_found() {
        let supervisor = make_supervisor().await;
        let err = supervisor.stop_stream_job("does-not-exist").unwrap_err();
        assert!(matches!(err, SupervisorError::ExecutionNotFound(_)));
    }

    #[tokio::test]
    async fn cleanup_is_idempotent_on_an_empty_table() {
        let supervisor = make_supervisor().await;
        supervisor.cleanup_completed_jobs();
        supervisor.cleanup_completed_jobs();
    }
}
