use tandem_core::errors::ProviderError;
use tandem_core::ids::{JobId, SessionId};
use tandem_core::jobs::JobError;
use tandem_store::StoreError;

/// Failures that end a turn or reject a coordinator call.
///
/// Recoverable tool errors never appear here; they are fed back to the model
/// as tool-result messages.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    #[error("tool {tool} failed fatally: {message}")]
    ToolFatal { tool: String, message: String },

    #[error("turn exceeded {0} round trips")]
    TurnLimitExceeded(u32),

    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),

    #[error("provider still rate limited after retries: {0}")]
    ProviderRateLimited(ProviderError),

    #[error("provider error: {0}")]
    ProviderFatal(ProviderError),

    #[error("unknown job: {0}")]
    UnknownJob(JobId),

    #[error("{0}")]
    Internal(String),
}

impl EngineError {
    /// Stable tag reported in the `TurnCompleted` event.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownSession(_) => "unknown_session",
            Self::ToolFatal { .. } => "tool_fatal",
            Self::TurnLimitExceeded(_) => "turn_limit_exceeded",
            Self::Persistence(_) => "persistence",
            Self::ProviderRateLimited(_) => "provider_rate_limited",
            Self::ProviderFatal(_) => "provider_fatal",
            Self::UnknownJob(_) => "unknown_job",
            Self::Internal(_) => "internal",
        }
    }
}

impl From<ProviderError> for EngineError {
    fn from(e: ProviderError) -> Self {
        if e.is_retryable() {
            Self::ProviderRateLimited(e)
        } else {
            Self::ProviderFatal(e)
        }
    }
}

impl From<JobError> for EngineError {
    fn from(e: JobError) -> Self {
        match e {
            JobError::UnknownJob(id) => Self::UnknownJob(id),
        }
    }
}
