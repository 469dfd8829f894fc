use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bson::Document;
use cdc_checkpoint::CheckpointStore;
use cdc_common::schema::Schema;
use cdc_common::{ChangeEvent, OperationType, ResumeToken};
use cdc_schema_eval::{build_evolved_schema, evaluate_batch, SchemaEvaluator};
use cdc_schema_registry::SchemaRegistry;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType as MongoOperationType};
use mongodb::change_stream::ChangeStream;
use mongodb::options::{ChangeStreamOptions, FullDocumentType};
use mongodb::Client;
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::cancellation::CancellationHandle;
use crate::config::StreamWatcherConfig;
use crate::error::{classify_source_error, CdcError, Result, SourceErrorClass};
use crate::retry::RetryState;
use crate::sink::{SchemaSinkAdapter, SinkCallback};

enum LoopExit {
    Stopped,
}

enum LoopError {
    Source(mongodb::error::Error),
    StreamClosed,
    Cdc(CdcError),
}

/// Long-lived cursor over a source collection's oplog (C4). Exactly one
/// instance drives the cursor loop; `stop()` may be called from any thread
/// (§4.4.8).
pub struct StreamWatcher {
    client: Client,
    config: StreamWatcherConfig,
    checkpoint_store: Arc<dyn CheckpointStore>,
    schema_registry: Option<Arc<dyn SchemaRegistry>>,
    schema_sink_adapter: Option<Arc<dyn SchemaSinkAdapter>>,
    cancellation: CancellationHandle,
    buffer: Mutex<Vec<ChangeEvent>>,
    current_resume_token: Mutex<Option<ResumeToken>>,
    last_checkpointed_token: Mutex<Option<ResumeToken>>,
    current_schema: Mutex<Option<Schema>>,
    last_flush_time: Mutex<Instant>,
    records_processed: AtomicI64,
    consecutive_checkpoint_failures: AtomicU32,
}

impl StreamWatcher {
    pub fn new(
        client: Client,
        config: StreamWatcherConfig,
        checkpoint_store: Arc<dyn CheckpointStore>,
        schema_registry: Option<Arc<dyn SchemaRegistry>>,
        schema_sink_adapter: Option<Arc<dyn SchemaSinkAdapter>>,
    ) -> Self {
        Self {
            client,
            config,
            checkpoint_store,
            schema_registry,
            schema_sink_adapter,
            cancellation: CancellationHandle::new(),
            buffer: Mutex::new(Vec::new()),
            current_resume_token: Mutex::new(None),
            last_checkpointed_token: Mutex::new(None),
            current_schema: Mutex::new(None),
            last_flush_time: Mutex::new(Instant::now()),
            records_processed: AtomicI64::new(0),
            consecutive_checkpoint_failures: AtomicU32::new(0),
        }
    }

    pub fn cancellation_handle(&self) -> CancellationHandle {
        self.cancellation.clone()
    }

    /// Cooperative; may be called from any thread; does not block (§4.4.2).
    pub fn stop(&self) {
        self.cancellation.stop();
    }

    /// Blocking. Runs until `stop()` is called, a terminal error occurs, or
    /// the cursor's retries are exhausted (§4.4.2).
    pub async fn start(&self, callback: Arc<dyn SinkCallback>) -> Result<()> {
        self.load_initial_state().await;

        let mut retry = RetryState::new(self.config.retry_backoff_base, self.config.max_retry_delay);
        let mut source_attempts = 0u32;

        loop {
            if self.cancellation.is_stopped() {
                return Ok(());
            }

            let mut stream = match self.open_cursor().await {
                Ok(s) => {
                    retry.reset();
                    source_attempts = 0;
                    s
                }
                Err(e) => {
                    self.handle_source_error(&e, &mut source_attempts, &mut retry).await?;
                    continue;
                }
            };

            match self.run_loop(&mut stream, &callback).await {
                Ok(LoopExit::Stopped) => {
                    self.final_flush(&callback).await?;
                    return Ok(());
                }
                Err(LoopError::Cdc(e)) => return Err(e),
                Err(LoopError::StreamClosed) => {
                    warn!(job_id = %self.config.job_id, "change stream ended unexpectedly, reconnecting");
                    source_attempts += 1;
                    if source_attempts > self.config.max_retries {
                        return Err(CdcError::MaxRetriesExceeded { attempts: source_attempts });
                    }
                    tokio::time::sleep(retry.advance()).await;
                }
                Err(LoopError::Source(e)) => {
                    self.handle_source_error(&e, &mut source_attempts, &mut retry).await?;
                }
            }
        }
    }

    async fn handle_source_error(
        &self,
        err: &mongodb::error::Error,
        source_attempts: &mut u32,
        retry: &mut RetryState,
    ) -> Result<()> {
        match classify_source_error(err) {
            SourceErrorClass::NonRetryable => Err(CdcError::NonRetryableSource(err.to_string())),
            SourceErrorClass::ResumeTokenInvalid => Err(CdcError::ResumeTokenInvalid {
                token: self.current_resume_token.lock().clone(),
            }),
            SourceErrorClass::Transient => {
                *source_attempts += 1;
                if *source_attempts > self.config.max_retries {
                    return Err(CdcError::MaxRetriesExceeded { attempts: *source_attempts });
                }
                warn!(
                    job_id = %self.config.job_id,
                    attempt = *source_attempts,
                    error = %err,
                    "transient change-stream error, retrying"
                );
                metrics::counter!("cdc_errors_total", "collection" => self.config.collection_name.clone(), "error_kind" => "transient_source").increment(1);
                tokio::time::sleep(retry.advance()).await;
                Ok(())
            }
        }
    }

    async fn load_initial_state(&self) {
        // `load_checkpoint` is the validated path (corrupted/empty tokens come
        // back as `None`, per the `CheckpointStore` contract); only a token
        // that passed validation may ever reach `current_resume_token` and
        // from there `open_cursor`'s `resume_after`. `load_checkpoint_state`
        // is raw, unvalidated storage access used solely to recover the
        // `records_processed` counter below, never the token itself.
        let validated_token = match self
            .checkpoint_store
            .load_checkpoint(&self.config.job_id, &self.config.collection_name)
            .await
        {
            Ok(token) => token,
            Err(e) => {
                warn!(job_id = %self.config.job_id, error = %e, "failed to load checkpoint, cold-starting");
                None
            }
        };

        match validated_token {
            Some(token) => {
                info!(job_id = %self.config.job_id, "resuming from checkpoint");
                *self.current_resume_token.lock() = Some(token.clone());
                *self.last_checkpointed_token.lock() = Some(token);

                match self
                    .checkpoint_store
                    .load_checkpoint_state(&self.config.job_id, &self.config.collection_name)
                    .await
                {
                    Ok(Some(checkpoint)) => {
                        self.records_processed.store(checkpoint.records_processed, Ordering::SeqCst);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(job_id = %self.config.job_id, error = %e, "failed to recover records_processed from checkpoint state");
                    }
                }
            }
            None => {
                info!(job_id = %self.config.job_id, "no checkpoint found, cold-starting from oplog head");
            }
        }

        if let (Some(registry), Some(table)) = (&self.schema_registry, &self.config.sink_table) {
            match registry.get_latest_schema(table).await {
                Ok(schema) => *self.current_schema.lock() = schema,
                Err(e) => warn!(table, error = %e, "failed to load current schema"),
            }
        }
    }

    async fn open_cursor(&self) -> mongodb::error::Result<ChangeStream<ChangeStreamEvent<Document>>> {
        let collection = self
            .client
            .database(&self.config.database)
            .collection::<Document>(&self.config.collection_name);

        let mut options = ChangeStreamOptions::builder()
            .full_document(Some(FullDocumentType::UpdateLookup))
            .max_await_time(Some(self.config.max_await_time))
            .build();

        if let Some(token) = self.current_resume_token.lock().clone() {
            match bson::from_document::<mongodb::change_stream::event::ResumeToken>(token.into_document()) {
                Ok(resume_after) => options.resume_after = Some(resume_after),
                Err(e) => warn!(error = %e, "stored resume token could not be decoded, opening from head"),
            }
        }

        let pipeline = self.config.filter_pipeline.clone().unwrap_or_default();

        info!(
            job_id = %self.config.job_id,
            database = %self.config.database,
            collection = %self.config.collection_name,
            "opening change stream"
        );
        collection.watch(pipeline, options).await
    }

    async fn run_loop(
        &self,
        stream: &mut ChangeStream<ChangeStreamEvent<Document>>,
        callback: &Arc<dyn SinkCallback>,
    ) -> std::result::Result<LoopExit, LoopError> {
        loop {
            if self.cancellation.is_stopped() {
                return Ok(LoopExit::Stopped);
            }

            let next = tokio::time::timeout(self.config.max_await_time, stream.next()).await;

            match next {
                Ok(Some(Ok(event))) => {
                    if self.cancellation.is_stopped() {
                        return Ok(LoopExit::Stopped);
                    }

                    let change_event = self.to_change_event(&event, stream.resume_token());
                    *self.current_resume_token.lock() = Some(change_event.resume_token.clone());

                    let lag = change_event.lag_seconds(Utc::now());
                    metrics::gauge!("cdc_lag_seconds", "collection" => self.config.collection_name.clone()).set(lag);
                    metrics::counter!(
                        "cdc_records_total",
                        "collection" => self.config.collection_name.clone(),
                        "operation" => operation_label(change_event.operation_type)
                    )
                    .increment(1);

                    self.buffer.lock().push(change_event);

                    if self.should_flush() {
                        self.flush(callback).await.map_err(LoopError::Cdc)?;
                    }
                }
                Ok(Some(Err(e))) => return Err(LoopError::Source(e)),
                Ok(None) => return Err(LoopError::StreamClosed),
                Err(_elapsed) => {
                    if self.should_flush() {
                        self.flush(callback).await.map_err(LoopError::Cdc)?;
                    }
                }
            }
        }
    }

    fn should_flush(&self) -> bool {
        let len = self.buffer.lock().len();
        if len == 0 {
            return false;
        }
        let elapsed = self.last_flush_time.lock().elapsed();
        len >= self.config.batch_size || elapsed >= self.config.batch_interval
    }

    /// Evaluate schema drift, call the sink, and persist the checkpoint for
    /// the buffered batch (§4.4.4 step 5). Leaves the buffer untouched on any
    /// error so the caller can retry or surface it.
    async fn flush(&self, callback: &Arc<dyn SinkCallback>) -> Result<()> {
        let batch: Vec<ChangeEvent> = self.buffer.lock().clone();
        if batch.is_empty() {
            return Ok(());
        }

        self.evaluate_schema_drift(&batch).await;

        let mut callback_retry = RetryState::new(self.config.retry_backoff_base, self.config.max_retry_delay);
        loop {
            match callback.call(&batch).await {
                Ok(()) => break,
                Err(e) => {
                    let attempt = callback_retry.attempt() + 1;
                    if attempt > self.config.max_retries {
                        return Err(CdcError::MaxRetriesExceeded { attempts: attempt });
                    }
                    warn!(job_id = %self.config.job_id, attempt, error = %e, "sink callback failed, retrying same batch");
                    metrics::counter!("cdc_errors_total", "collection" => self.config.collection_name.clone(), "error_kind" => "callback").increment(1);
                    tokio::time::sleep(callback_retry.advance()).await;
                }
            }
        }

        let token = self.current_resume_token.lock().clone();
        if let Some(token) = token {
            let last_event_time = batch.last().map(|e| e.cluster_time);
            let new_total = self.records_processed.load(Ordering::SeqCst) + batch.len() as i64;

            match self
                .checkpoint_store
                .save_checkpoint(&self.config.job_id, &self.config.collection_name, token.clone(), last_event_time, new_total)
                .await
            {
                Ok(()) => {
                    self.consecutive_checkpoint_failures.store(0, Ordering::SeqCst);
                    *self.last_checkpointed_token.lock() = Some(token);
                    self.records_processed.store(new_total, Ordering::SeqCst);
                }
                Err(e) => {
                    let failures = self.consecutive_checkpoint_failures.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(job_id = %self.config.job_id, failures, error = %e, "checkpoint save failed");
                    self.records_processed.store(new_total, Ordering::SeqCst);
                    if failures >= self.config.checkpoint_failure_threshold {
                        self.buffer.lock().clear();
                        *self.last_flush_time.lock() = Instant::now();
                        return Err(CdcError::CheckpointEscalated { consecutive_failures: failures, source: e });
                    }
                }
            }
        }

        self.buffer.lock().clear();
        *self.last_flush_time.lock() = Instant::now();
        Ok(())
    }

    async fn evaluate_schema_drift(&self, batch: &[ChangeEvent]) {
        let (Some(registry), Some(table)) = (&self.schema_registry, &self.config.sink_table) else {
            return;
        };
        let Some(schema) = self.current_schema.lock().clone() else {
            return;
        };

        let documents: Vec<Document> = batch
            .iter()
            .filter(|e| e.operation_type.carries_full_document())
            .filter_map(|e| e.full_document.clone())
            .collect();
        if documents.is_empty() {
            return;
        }

        let result = evaluate_batch(&documents, &schema);

        if result.has_breaking() {
            error!(
                table,
                breaking = result.breaking_changes.len(),
                "breaking schema changes detected, batch still delivered"
            );
            metrics::counter!("cdc_errors_total", "collection" => self.config.collection_name.clone(), "error_kind" => "schema_breaking").increment(1);
        }

        if result.has_safe() {
            let evaluator = SchemaEvaluator::new(registry.clone());
            match evaluator
                .evolve_sink_schema(table, &schema, &result.safe_changes, &self.config.schema_applied_by)
                .await
            {
                Ok(ddl) if !ddl.is_empty() => {
                    let evolved = build_evolved_schema(&schema, &result.safe_changes);
                    *self.current_schema.lock() = Some(evolved);

                    if let Some(adapter) = &self.schema_sink_adapter {
                        if let Err(e) = adapter.apply_ddl(table, &ddl).await {
                            warn!(table, error = %e, "failed to forward schema DDL to sink, will retry next batch");
                        }
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(table, error = %e, "schema evolution failed, batch still delivered"),
            }
        }
    }

    /// Flush whatever remains buffered on cooperative shutdown (§4.4.6). If
    /// the callback never succeeds, re-persist the last acknowledged token so
    /// no event is silently dropped.
    async fn final_flush(&self, callback: &Arc<dyn SinkCallback>) -> Result<()> {
        match self.flush(callback).await {
            Ok(()) => Ok(()),
            Err(e) => {
                error!(job_id = %self.config.job_id, error = %e, "final flush failed");
                if let Some(token) = self.last_checkpointed_token.lock().clone() {
                    let _ = self
                        .checkpoint_store
                        .save_checkpoint(
                            &self.config.job_id,
                            &self.config.collection_name,
                            token,
                            None,
                            self.records_processed.load(Ordering::SeqCst),
                        )
                        .await;
                }
                Err(CdcError::CallbackFinalFlush(e.to_string()))
            }
        }
    }

    fn to_change_event(
        &self,
        event: &ChangeStreamEvent<Document>,
        token: Option<mongodb::change_stream::event::ResumeToken>,
    ) -> ChangeEvent {
        let operation_type = map_operation_type(&event.operation_type);
        let document_key = event.document_key.clone().unwrap_or_default();
        let full_document = event.full_document.clone();
        let cluster_time = event
            .cluster_time
            .and_then(|ts| DateTime::<Utc>::from_timestamp(ts.time as i64, 0))
            .unwrap_or_else(Utc::now);
        let resume_token = token
            .and_then(|t| bson::to_document(&t).ok())
            .map(ResumeToken::new)
            .unwrap_or_else(|| ResumeToken::new(Document::new()));

        ChangeEvent {
            operation_type,
            document_key,
            full_document,
            cluster_time,
            resume_token,
        }
    }
}

fn map_operation_type(op: &MongoOperationType) -> OperationType {
    match op {
        MongoOperationType::Insert => OperationType::Insert,
        MongoOperationType::Update => OperationType::Update,
        MongoOperationType::Replace => OperationType::Replace,
        MongoOperationType::Delete => OperationType::Delete,
        MongoOperationType::Invalidate => OperationType::Invalidate,
        MongoOperationType::Drop => OperationType::Drop,
        MongoOperationType::Rename => OperationType::Rename,
        _ => OperationType::Other,
    }
}

fn operation_label(op: OperationType) -> &'static str {
    match op {
        OperationType::Insert => "insert",
        OperationType::Update => "update",
        OperationType::Replace => "replace",
        OperationType::Delete => "delete",
        OperationType::Invalidate => "invalidate",
        OperationType::Drop => "drop",
        OperationType::Rename => "rename",
        OperationType::Other => "other",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bson::doc;
    use cdc_common::Checkpoint;
    use cdc_schema_registry::sqlite::SqliteSchemaRegistry;
    use sqlx::SqlitePool;
    use std::sync::atomic::AtomicU32;

    struct FakeCheckpointStore {
        state: Mutex<Option<Checkpoint>>,
        saves_seen: AtomicU32,
        fail_next_saves: AtomicU32,
    }

    impl FakeCheckpointStore {
        fn new() -> Self {
            Self {
                state: Mutex::new(None),
                saves_seen: AtomicU32::new(0),
                fail_next_saves: AtomicU32::new(0),
            }
        }

        fn failing(times: u32) -> Self {
            let store = Self::new();
            store.fail_next_saves.store(times, Ordering::SeqCst);
            store
        }

        /// Seeds a row whose stored token fails `ResumeToken::is_valid()`,
        /// simulating a corrupted checkpoint row on restart.
        fn with_corrupted_token(records_processed: i64) -> Self {
            let store = Self::new();
            let now = Utc::now();
            *store.state.lock() = Some(Checkpoint {
                job_id: "job-1".to_string(),
                collection: "orders".to_string(),
                resume_token: ResumeToken::new(Document::new()),
                last_event_time: None,
                records_processed,
                created_at: now,
                updated_at: now,
            });
            store
        }
    }

    #[async_trait]
    impl CheckpointStore for FakeCheckpointStore {
        async fn save_checkpoint(
            &self,
            job_id: &str,
            collection: &str,
            resume_token: ResumeToken,
            last_event_time: Option<DateTime<Utc>>,
            records_processed: i64,
        ) -> cdc_checkpoint::Result<()> {
            if self.fail_next_saves.load(Ordering::SeqCst) > 0 {
                self.fail_next_saves.fetch_sub(1, Ordering::SeqCst);
                return Err(cdc_checkpoint::CheckpointError::Database("simulated outage".into()));
            }
            self.saves_seen.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            *self.state.lock() = Some(Checkpoint {
                job_id: job_id.to_string(),
                collection: collection.to_string(),
                resume_token,
                last_event_time,
                records_processed,
                created_at: now,
                updated_at: now,
            });
            Ok(())
        }

        async fn load_checkpoint(&self, _job_id: &str, _collection: &str) -> cdc_checkpoint::Result<Option<ResumeToken>> {
            // Mirrors `BackendCheckpointStore::load_checkpoint`: a corrupted
            // stored token is reported as no checkpoint at all.
            Ok(self.state.lock().clone().and_then(|c| c.resume_token.is_valid().then_some(c.resume_token)))
        }

        async fn delete_checkpoint(&self, _job_id: &str, _collection: &str) -> cdc_checkpoint::Result<()> {
            *self.state.lock() = None;
            Ok(())
        }

        async fn load_checkpoint_state(&self, _job_id: &str, _collection: &str) -> cdc_checkpoint::Result<Option<Checkpoint>> {
            Ok(self.state.lock().clone())
        }
    }

    struct FakeSink {
        calls: Mutex<Vec<Vec<ChangeEvent>>>,
        fail_next_calls: AtomicU32,
    }

    impl FakeSink {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()), fail_next_calls: AtomicU32::new(0) }
        }

        fn failing(times: u32) -> Self {
            let sink = Self::new();
            sink.fail_next_calls.store(times, Ordering::SeqCst);
            sink
        }
    }

    #[async_trait]
    impl SinkCallback for FakeSink {
        async fn call(&self, batch: &[ChangeEvent]) -> anyhow::Result<()> {
            if self.fail_next_calls.load(Ordering::SeqCst) > 0 {
                self.fail_next_calls.fetch_sub(1, Ordering::SeqCst);
                return Err(anyhow::anyhow!("sink temporarily unavailable"));
            }
            self.calls.lock().push(batch.to_vec());
            Ok(())
        }
    }

    fn event(id: i32, full_document: Option<Document>) -> ChangeEvent {
        ChangeEvent {
            operation_type: OperationType::Insert,
            document_key: doc! { "_id": id },
            full_document,
            cluster_time: Utc::now(),
            resume_token: ResumeToken::new(doc! { "_data": format!("token-{id}") }),
        }
    }

    async fn make_watcher(
        config: StreamWatcherConfig,
        checkpoint_store: Arc<dyn CheckpointStore>,
        schema_registry: Option<Arc<dyn SchemaRegistry>>,
    ) -> StreamWatcher {
        let client = Client::with_uri_str("mongodb://127.0.0.1:27017").await.unwrap();
        StreamWatcher::new(client, config, checkpoint_store, schema_registry, None)
    }

    fn test_config(batch_size: usize, batch_interval_secs: u64) -> StreamWatcherConfig {
        let mut config = StreamWatcherConfig::new("job-1", "testdb", "orders");
        config.batch_size = batch_size;
        config.batch_interval = std::time::Duration::from_secs(batch_interval_secs);
        config.retry_backoff_base = 0.01;
        config.max_retry_delay = std::time::Duration::from_millis(50);
        config.max_retries = 5;
        config
    }

    #[tokio::test]
    async fn happy_path_flushes_on_batch_size_and_advances_checkpoint() {
        let store = Arc::new(FakeCheckpointStore::new());
        let watcher = make_watcher(test_config(3, 60), store.clone(), None).await;
        let sink = Arc::new(FakeSink::new());

        for i in 1..=3 {
            watcher.buffer.lock().push(event(i, None));
            *watcher.current_resume_token.lock() = Some(event(i, None).resume_token);
        }
        assert!(watcher.should_flush());

        let cb: Arc<dyn SinkCallback> = sink.clone();
        watcher.flush(&cb).await.unwrap();

        assert_eq!(sink.calls.lock().len(), 1);
        assert_eq!(sink.calls.lock()[0].len(), 3);
        assert_eq!(watcher.records_processed.load(Ordering::SeqCst), 3);
        assert_eq!(store.saves_seen.load(Ordering::SeqCst), 1);
        assert!(watcher.buffer.lock().is_empty());
    }

    #[tokio::test]
    async fn corrupted_resume_token_on_restart_cold_starts() {
        let store = Arc::new(FakeCheckpointStore::with_corrupted_token(5));
        let watcher = make_watcher(test_config(2, 60), store.clone(), None).await;

        watcher.load_initial_state().await;

        // The corrupted token must never reach the watcher's live cursor
        // state (and from there `open_cursor`'s `resume_after`) — it cold-starts instead.
        assert!(watcher.current_resume_token.lock().is_none());
        assert!(watcher.last_checkpointed_token.lock().is_none());
        assert_eq!(watcher.records_processed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn empty_buffer_never_calls_sink_or_checkpoint() {
        let store = Arc::new(FakeCheckpointStore::new());
        let watcher = make_watcher(test_config(3, 60), store.clone(), None).await;
        let sink = Arc::new(FakeSink::new());

        assert!(!watcher.should_flush());
        let cb: Arc<dyn SinkCallback> = sink.clone();
        watcher.flush(&cb).await.unwrap();

        assert_eq!(sink.calls.lock().len(), 0);
        assert_eq!(store.saves_seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn callback_failure_retries_same_batch_without_advancing_token_early() {
        let store = Arc::new(FakeCheckpointStore::new());
        let watcher = make_watcher(test_config(2, 60), store.clone(), None).await;
        let sink = Arc::new(FakeSink::failing(1));

        let e1 = event(1, None);
        let e2 = event(2, None);
        watcher.buffer.lock().push(e1.clone());
        watcher.buffer.lock().push(e2.clone());
        *watcher.current_resume_token.lock() = Some(e2.resume_token.clone());

        let cb: Arc<dyn SinkCallback> = sink.clone();
        watcher.flush(&cb).await.unwrap();

        // One failed call plus one successful retry, both with the identical batch.
        assert_eq!(sink.calls.lock().len(), 1);
        assert_eq!(sink.calls.lock()[0].len(), 2);
        assert_eq!(store.saves_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn checkpoint_failures_below_threshold_do_not_abort_the_batch() {
        let store = Arc::new(FakeCheckpointStore::failing(1));
        let mut config = test_config(2, 60);
        config.checkpoint_failure_threshold = 2;
        let watcher = make_watcher(config, store.clone(), None).await;
        let sink = Arc::new(FakeSink::new());

        watcher.buffer.lock().push(event(1, None));
        watcher.buffer.lock().push(event(2, None));
        *watcher.current_resume_token.lock() = Some(event(2, None).resume_token);

        let cb: Arc<dyn SinkCallback> = sink.clone();
        watcher.flush(&cb).await.unwrap();

        assert_eq!(sink.calls.lock().len(), 1);
        assert!(watcher.buffer.lock().is_empty());
        assert_eq!(watcher.records_processed.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn checkpoint_failures_at_threshold_escalate_to_terminal_error() {
        let store = Arc::new(FakeCheckpointStore::failing(2));
        let mut config = test_config(2, 60);
        config.checkpoint_failure_threshold = 2;
        let watcher = make_watcher(config, store.clone(), None).await;
        let sink = Arc::new(FakeSink::new());

        watcher.buffer.lock().push(event(1, None));
        watcher.buffer.lock().push(event(2, None));
        *watcher.current_resume_token.lock() = Some(event(2, None).resume_token);

        let cb: Arc<dyn SinkCallback> = sink.clone();
        let result = watcher.flush(&cb).await;

        assert!(matches!(result, Err(CdcError::CheckpointEscalated { consecutive_failures: 2, .. })));
    }

    #[tokio::test]
    async fn safe_schema_drift_evolves_schema_and_still_delivers_batch() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let registry = SqliteSchemaRegistry::new(pool);
        registry.init_schema().await.unwrap();

        let mut schema = Schema::new();
        schema.insert(
            "name".to_string(),
            cdc_common::schema::SchemaField::new(cdc_common::schema::FieldType::String, false),
        );
        schema.insert(
            "price".to_string(),
            cdc_common::schema::SchemaField::new(cdc_common::schema::FieldType::Float, false),
        );
        registry.register_version("products", &schema, &[], "seed", None).await.unwrap();

        let registry: Arc<dyn SchemaRegistry> = Arc::new(registry);
        let store = Arc::new(FakeCheckpointStore::new());
        let mut config = test_config(2, 60);
        config.sink_table = Some("products".to_string());
        let watcher = make_watcher(config, store, Some(registry.clone())).await;
        watcher.load_initial_state().await;

        let doc_a = doc! { "name": "A", "price": 1.0, "tag": "x" };
        let doc_b = doc! { "name": "B", "price": 2.0, "tag": "y" };
        watcher.buffer.lock().push(event(1, Some(doc_a)));
        watcher.buffer.lock().push(event(2, Some(doc_b)));
        *watcher.current_resume_token.lock() = Some(event(2, None).resume_token);

        let sink = Arc::new(FakeSink::new());
        let cb: Arc<dyn SinkCallback> = sink.clone();
        watcher.flush(&cb).await.unwrap();

        assert_eq!(sink.calls.lock().len(), 1);
        let evolved_schema = registry.get_latest_schema("products").await.unwrap().unwrap();
        assert!(evolved_schema.contains_key("tag"));
        assert_eq!(watcher.current_schema.lock().as_ref().unwrap()["tag"].field_type, cdc_common::schema::FieldType::String);
    }

    #[tokio::test]
    async fn breaking_schema_drift_does_not_evolve_but_still_delivers() {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let registry = SqliteSchemaRegistry::new(pool);
        registry.init_schema().await.unwrap();

        let mut schema = Schema::new();
        schema.insert(
            "id".to_string(),
            cdc_common::schema::SchemaField::new(cdc_common::schema::FieldType::String, false),
        );
        registry.register_version("widgets", &schema, &[], "seed", None).await.unwrap();

        let registry: Arc<dyn SchemaRegistry> = Arc::new(registry);
        let store = Arc::new(FakeCheckpointStore::new());
        let mut config = test_config(1, 60);
        config.sink_table = Some("widgets".to_string());
        let watcher = make_watcher(config, store, Some(registry.clone())).await;
        watcher.load_initial_state().await;

        watcher.buffer.lock().push(event(1, Some(doc! { "id": 42 })));
        *watcher.current_resume_token.lock() = Some(event(1, None).resume_token);

        let sink = Arc::new(FakeSink::new());
        let cb: Arc<dyn SinkCallback> = sink.clone();
        watcher.flush(&cb).await.unwrap();

        assert_eq!(sink.calls.lock().len(), 1);
        // version 1 only; no version 2 was registered for the breaking change
        assert_eq!(registry.get_latest_version_number("widgets").await.unwrap(), 1);
    }
}
