use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use cdc_checkpoint::CheckpointStore;
use cdc_common::job::{JobConfig, JobStatus};
use cdc_schema_registry::SchemaRegistry;
use cdc_stream::{CancellationHandle, StreamWatcher, StreamWatcherConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::{Result, SupervisorError};
use crate::sink_factory::SinkFactory;

/// Point-in-time view of one execution, returned by `get_stream_job_status`.
#[derive(Debug, Clone)]
pub struct StreamJobStatus {
    pub execution_id: String,
    pub job_id: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub is_running: bool,
}

struct Worker {
    job_id: String,
    status: Mutex<JobStatus>,
    started_at: DateTime<Utc>,
    cancellation: CancellationHandle,
    handle: JoinHandle<()>,
}

impl Worker {
    fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// How the watcher's dedicated task ended, as observed by the reaping task
/// that awaits its `JoinHandle`.
enum WorkerOutcome {
    Finished(cdc_stream::Result<()>),
    Panicked(String),
}

/// One watcher per running stream job (C5). Owns process-wide signal
/// handling and is the single place that flips a watcher's cancellation
/// handle; the watcher itself never touches process state (§9).
pub struct StreamJobSupervisor {
    mongo_client: mongodb::Client,
    checkpoint_store: Arc<dyn CheckpointStore>,
    schema_registry: Option<Arc<dyn SchemaRegistry>>,
    sink_factory: Arc<dyn SinkFactory>,
    workers: DashMap<String, Worker>,
    running_jobs: DashMap<String, String>,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
}

impl StreamJobSupervisor {
    pub fn new(
        mongo_client: mongodb::Client,
        checkpoint_store: Arc<dyn CheckpointStore>,
        schema_registry: Option<Arc<dyn SchemaRegistry>>,
        sink_factory: Arc<dyn SinkFactory>,
    ) -> Arc<Self> {
        let (shutdown_tx, _) = broadcast::channel(1);
        Arc::new(Self {
            mongo_client,
            checkpoint_store,
            schema_registry,
            sink_factory,
            workers: DashMap::new(),
            running_jobs: DashMap::new(),
            running: AtomicBool::new(true),
            shutdown_tx,
        })
    }

    /// Creates a `JobExecution{status=RUNNING}`, instantiates a watcher on a
    /// dedicated task, and returns immediately (§4.5). Only one RUNNING
    /// execution per `job_id` is allowed at a time.
    pub fn start_stream_job(self: &Arc<Self>, job: JobConfig) -> Result<String> {
        if let Some(existing) = self.running_jobs.get(&job.job_id) {
            return Err(SupervisorError::AlreadyRunning(existing.clone()));
        }

        let execution_id = uuid::Uuid::new_v4().to_string();
        let watcher_config = StreamWatcherConfig::from(&job);
        let sink = self.sink_factory.build_sink(&job);
        let schema_sink_adapter = self.sink_factory.build_schema_adapter(&job);

        let watcher = Arc::new(StreamWatcher::new(
            self.mongo_client.clone(),
            watcher_config,
            self.checkpoint_store.clone(),
            self.schema_registry.clone(),
            schema_sink_adapter,
        ));
        let cancellation = watcher.cancellation_handle();

        let job_id = job.job_id.clone();
        let execution_id_for_task = execution_id.clone();
        let supervisor = self.clone();

        let handle = tokio::spawn(async move {
            // Run the watcher on its own task so a panic inside `start()`
            // surfaces as a `JoinError` here instead of unwinding this
            // reaping task and leaving the execution stuck at RUNNING.
            let inner = tokio::spawn(async move { watcher.start(sink).await });
            let outcome = match inner.await {
                Ok(result) => WorkerOutcome::Finished(result),
                Err(join_err) => WorkerOutcome::Panicked(join_err.to_string()),
            };
            supervisor.on_worker_exit(&execution_id_for_task, outcome);
        });

        self.workers.insert(
            execution_id.clone(),
            Worker {
                job_id: job_id.clone(),
                status: Mutex::new(JobStatus::Running),
                started_at: Utc::now(),
                cancellation,
                handle,
            },
        );
        self.running_jobs.insert(job_id, execution_id.clone());

        Ok(execution_id)
    }

    fn on_worker_exit(&self, execution_id: &str, outcome: WorkerOutcome) {
        let Some(worker) = self.workers.get(execution_id) else {
            return;
        };
        let final_status = match outcome {
            WorkerOutcome::Finished(Ok(())) => {
                if worker.cancellation.is_stopped() {
                    JobStatus::Cancelled
                } else {
                    JobStatus::Success
                }
            }
            WorkerOutcome::Finished(Err(e)) => {
                error!(execution_id, job_id = %worker.job_id, error = %e, "stream watcher terminated");
                JobStatus::Failed
            }
            WorkerOutcome::Panicked(message) => {
                let err = SupervisorError::WorkerPanicked(execution_id.to_string(), message);
                error!(execution_id, job_id = %worker.job_id, error = %err, "stream watcher task panicked");
                JobStatus::Failed
            }
        };
        *worker.status.lock() = final_status;
        self.running_jobs.remove(&worker.job_id);
    }

    /// Signals the watcher to stop (cooperative); marks the execution
    /// CANCELLED once the worker actually exits (§4.5). Returns `not_found`
    /// (as `SupervisorError::ExecutionNotFound`) for an unknown id.
    pub fn stop_stream_job(&self, execution_id: &str) -> Result<()> {
        let worker = self
            .workers
            .get(execution_id)
            .ok_or_else(|| SupervisorError::ExecutionNotFound(execution_id.to_string()))?;
        worker.cancellation.stop();
        Ok(())
    }

    pub fn get_stream_job_status(&self, execution_id: &str) -> Result<StreamJobStatus> {
        let worker = self
            .workers
            .get(execution_id)
            .ok_or_else(|| SupervisorError::ExecutionNotFound(execution_id.to_string()))?;
        Ok(StreamJobStatus {
            execution_id: execution_id.to_string(),
            job_id: worker.job_id.clone(),
            status: *worker.status.lock(),
            started_at: worker.started_at,
            is_running: worker.is_running(),
        })
    }

    /// Idempotent; removes terminal executions from the in-memory worker
    /// table (§4.5). Never touches persisted `JobExecution` rows.
    pub fn cleanup_completed_jobs(&self) {
        let terminal: Vec<String> = self
            .workers
            .iter()
            .filter(|entry| !entry.value().is_running())
            .map(|entry| entry.key().clone())
            .collect();

        for execution_id in terminal {
            if let Some((_, worker)) = self.workers.remove(&execution_id) {
                self.running_jobs.remove(&worker.job_id);
            }
        }
    }

    /// Periodic health bookkeeping (§4.5's "optional conveniences"): detects a
    /// worker task that died without updating its own status, restarts
    /// nothing by itself (restart policy belongs to the control plane), and
    /// sweeps the in-memory table the same way `cleanup_completed_jobs` does.
    pub fn spawn_health_monitor(self: &Arc<Self>, interval: Duration) {
        let supervisor = self.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let dead: Vec<String> = supervisor
                            .workers
                            .iter()
                            .filter(|e| !e.value().is_running() && matches!(*e.value().status.lock(), JobStatus::Running))
                            .map(|e| e.key().clone())
                            .collect();
                        for execution_id in dead {
                            warn!(execution_id, "worker task ended without reporting a terminal status");
                            if let Some(worker) = supervisor.workers.get(&execution_id) {
                                *worker.status.lock() = JobStatus::Failed;
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
    }

    /// Installs `SIGINT`/`SIGTERM` handling once at process start (§4.5,
    /// §9). On receipt, stops every running watcher and awaits their
    /// graceful exit up to `timeout` before returning.
    pub fn spawn_signal_handler(self: &Arc<Self>, timeout: Duration) {
        let supervisor = self.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            info!("shutdown signal received, stopping stream jobs");
            supervisor.shutdown(timeout).await;
        });
    }

    /// Broadcasts cooperative shutdown to every running watcher and to the
    /// supervisor's own background tasks, then awaits their exit up to
    /// `timeout`.
    pub async fn shutdown(&self, timeout: Duration) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.shutdown_tx.send(());

        for entry in self.workers.iter() {
            entry.value().cancellation.stop();
        }

        let deadline = tokio::time::Instant::now() + timeout;
        for execution_id in self.workers.iter().map(|e| e.key().clone()).collect::<Vec<_>>() {
            if let Some((_, worker)) = self.workers.remove(&execution_id) {
                let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
                if tokio::time::timeout(remaining, worker.handle).await.is_err() {
                    warn!(execution_id, "watcher did not exit within the shutdown timeout");
                }
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
