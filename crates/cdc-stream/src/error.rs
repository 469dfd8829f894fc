use cdc_common::ResumeToken;

/// Error taxonomy for the watcher's main loop (§4.4.7, §7).
#[derive(Debug, thiserror::Error)]
pub enum CdcError {
    #[error("change stream retries exhausted after {attempts} attempts")]
    MaxRetriesExceeded { attempts: u32 },

    #[error("non-retryable source error: {0}")]
    NonRetryableSource(String),

    #[error("resume token no longer valid in the oplog window: {token:?}")]
    ResumeTokenInvalid { token: Option<ResumeToken> },

    #[error("checkpoint store failed {consecutive_failures} consecutive saves: {source}")]
    CheckpointEscalated {
        consecutive_failures: u32,
        source: cdc_checkpoint::CheckpointError,
    },

    #[error("sink callback failed during final flush: {0}")]
    CallbackFinalFlush(String),
}

impl CdcError {
    /// The `kind` surfaced to the supervisor/job-registry per §7.
    pub fn kind(&self) -> &'static str {
        match self {
            CdcError::MaxRetriesExceeded { .. } => "max_retries_exceeded",
            CdcError::NonRetryableSource(_) => "non_retryable_source",
            CdcError::ResumeTokenInvalid { .. } => "resume_token_error",
            CdcError::CheckpointEscalated { .. } => "checkpoint_escalated",
            CdcError::CallbackFinalFlush(_) => "callback_error",
        }
    }
}

/// How a source-cursor failure should be handled by the retry loop (§4.4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceErrorClass {
    Transient,
    NonRetryable,
    ResumeTokenInvalid,
}

/// Classify a change-stream error by inspecting the driver's message.
///
/// The mongodb crate's error kinds don't expose a single "is this worth
/// retrying" predicate that covers server-selection timeouts, transient
/// network resets, and stale-resume-token responses uniformly, so — same as
/// the rest of this codebase's driver-error handling — this falls back to
/// matching on the rendered message.
pub fn classify_source_error(err: &mongodb::error::Error) -> SourceErrorClass {
    let message = err.to_string().to_lowercase();

    let resume_token_stale = message.contains("changestreamhistorylost")
        || message.contains("resume point may no longer be in the oplog")
        || message.contains("resume of change stream was not possible");

    if resume_token_stale {
        return SourceErrorClass::ResumeTokenInvalid;
    }

    let non_retryable = message.contains("authentication failed")
        || message.contains("unauthorized")
        || message.contains("not authorized");

    if non_retryable {
        return SourceErrorClass::NonRetryable;
    }

    SourceErrorClass::Transient
}

pub type Result<T> = std::result::Result<T, CdcError>;
