//! Durable, transactional `(job, collection)` → resume-token mapping (C1).
//!
//! Exactly one checkpoint row exists per `(job_id, collection)`. Writers are
//! expected to be single-threaded per job; the backend's row-level locking
//! only defends against an accidental second writer, it is not relied on for
//! normal operation.

pub mod error;

#[cfg(feature = "sqlite")]
pub mod sqlite;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "mysql")]
pub mod mysql;

use std::time::Duration;

use async_trait::async_trait;
use cdc_common::{Checkpoint, ResumeToken};
use chrono::{DateTime, Utc};
use tracing::warn;

pub use error::{CheckpointError, Result};

/// Retry policy for transient backend failures (§4.1): up to three attempts,
/// backing off from one second towards ten.
const MAX_SAVE_ATTEMPTS: u32 = 3;
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(10);

/// Raw single-attempt storage operations a concrete backend implements.
/// [`CheckpointStore`] wraps a backend with validation, retry, and metrics so
/// the backends themselves stay dumb.
#[async_trait]
pub trait CheckpointBackend: Send + Sync {
    async fn upsert(
        &self,
        job_id: &str,
        collection: &str,
        resume_token: &ResumeToken,
        last_event_time: Option<DateTime<Utc>>,
        records_processed: i64,
    ) -> Result<()>;

    async fn fetch(&self, job_id: &str, collection: &str) -> Result<Option<Checkpoint>>;

    async fn remove(&self, job_id: &str, collection: &str) -> Result<()>;
}

/// The public contract (§4.1), backed by any [`CheckpointBackend`].
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn save_checkpoint(
        &self,
        job_id: &str,
        collection: &str,
        resume_token: ResumeToken,
        last_event_time: Option<DateTime<Utc>>,
        records_processed: i64,
    ) -> Result<()>;

    async fn load_checkpoint(&self, job_id: &str, collection: &str) -> Result<Option<ResumeToken>>;

    async fn delete_checkpoint(&self, job_id: &str, collection: &str) -> Result<()>;

    /// The full checkpoint row, including `records_processed`. The watcher
    /// needs this on startup to keep the persisted counter monotonic (I2)
    /// across restarts; `load_checkpoint` alone only hands back the token
    /// the public contract names in §4.1.
    async fn load_checkpoint_state(&self, job_id: &str, collection: &str) -> Result<Option<Checkpoint>>;
}

/// Adapts any [`CheckpointBackend`] into the validated, retrying
/// [`CheckpointStore`] contract.
pub struct BackendCheckpointStore<B: CheckpointBackend> {
    backend: B,
}

impl<B: CheckpointBackend> BackendCheckpointStore<B> {
    pub fn new(backend: B) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl<B: CheckpointBackend> CheckpointStore for BackendCheckpointStore<B> {
    async fn save_checkpoint(
        &self,
        job_id: &str,
        collection: &str,
        resume_token: ResumeToken,
        last_event_time: Option<DateTime<Utc>>,
        records_processed: i64,
    ) -> Result<()> {
        if !resume_token.is_valid() {
            metrics::counter!("checkpoint_saves_total", "status" => "invalid").increment(1);
            return Err(CheckpointError::InvalidToken);
        }

        let mut attempt = 0u32;
        let mut backoff = INITIAL_BACKOFF;

        loop {
            attempt += 1;
            match self
                .backend
                .upsert(job_id, collection, &resume_token, last_event_time, records_processed)
                .await
            {
                Ok(()) => {
                    metrics::counter!("checkpoint_saves_total", "status" => "success").increment(1);
                    return Ok(());
                }
                Err(e) if e.is_retryable() && attempt < MAX_SAVE_ATTEMPTS => {
                    warn!(
                        job_id,
                        collection,
                        attempt,
                        error = %e,
                        "transient checkpoint save failure, retrying"
                    );
                    metrics::counter!("checkpoint_saves_total", "status" => "retry").increment(1);
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
                Err(e) => {
                    metrics::counter!("checkpoint_saves_total", "status" => "error").increment(1);
                    return Err(e);
                }
            }
        }
    }

    async fn load_checkpoint(&self, job_id: &str, collection: &str) -> Result<Option<ResumeToken>> {
        match self.backend.fetch(job_id, collection).await {
            Ok(Some(checkpoint)) if checkpoint.resume_token.is_valid() => {
                metrics::counter!("checkpoint_loads_total", "status" => "success").increment(1);
                Ok(Some(checkpoint.resume_token))
            }
            Ok(Some(_)) => {
                warn!(job_id, collection, "stored resume token is corrupted, cold-starting");
                metrics::counter!("checkpoint_loads_total", "status" => "invalid").increment(1);
                Ok(None)
            }
            Ok(None) => {
                metrics::counter!("checkpoint_loads_total", "status" => "not_found").increment(1);
                Ok(None)
            }
            Err(e) => {
                metrics::counter!("checkpoint_loads_total", "status" => "error").increment(1);
                Err(e)
            }
        }
    }

    async fn delete_checkpoint(&self, job_id: &str, collection: &str) -> Result<()> {
        self.backend.remove(job_id, collection).await
    }

    async fn load_checkpoint_state(&self, job_id: &str, collection: &str) -> Result<Option<Checkpoint>> {
        self.backend.fetch(job_id, collection).await
    }
}
