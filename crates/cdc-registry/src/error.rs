#[derive(Debug, thiserror::Error)]
pub enum JobRegistryError {
    #[error("job registry database error: {0}")]
    Database(String),

    #[error("job registry serialization error: {0}")]
    Serialization(String),

    #[error("job {0} already exists")]
    DuplicateJob(String),

    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("execution {0} not found")]
    ExecutionNotFound(String),

    #[error("job {0} is disabled")]
    JobDisabled(String),
}

pub type Result<T> = std::result::Result<T, JobRegistryError>;
