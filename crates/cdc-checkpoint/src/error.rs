#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("resume token is invalid or empty")]
    InvalidToken,

    #[error("checkpoint database error: {0}")]
    Database(String),

    #[error("checkpoint authentication error: {0}")]
    Authentication(String),

    #[error("checkpoint serialization error: {0}")]
    Serialization(String),
}

impl CheckpointError {
    /// Transient backend errors are worth retrying with backoff (§4.1);
    /// integrity violations, bad input, and auth failures surface immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CheckpointError::Database(_))
    }
}

pub type Result<T> = std::result::Result<T, CheckpointError>;
