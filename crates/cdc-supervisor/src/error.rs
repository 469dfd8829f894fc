/// Errors surfaced by the stream job supervisor (C5), distinct from the
/// per-watcher `CdcError` it wraps when recording a terminal `JobResult`.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("job {0} already has a running execution")]
    AlreadyRunning(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(String),

    #[error("watcher task for execution {0} panicked: {1}")]
    WorkerPanicked(String, String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;
