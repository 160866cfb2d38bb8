use std::time::Duration;

/// How the engine should react to a [`ProviderError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retrying the same request cannot succeed.
    Fatal,
    /// Worth retrying after a delay.
    Transient,
    /// Raised locally (timeout, cancellation); the caller decides.
    Local,
}

/// Errors surfaced by an LLM provider collaborator.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("context window exceeded: {actual} > {limit}")]
    ContextWindowExceeded { limit: usize, actual: usize },
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    Overloaded,
    #[error("network error: {0}")]
    Network(String),
    #[error("stream interrupted: {0}")]
    StreamInterrupted(String),

    #[error("timeout after {0:?}")]
    Timeout(Duration),
    #[error("cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AuthenticationFailed(_)
            | Self::ContextWindowExceeded { .. }
            | Self::InvalidRequest(_) => ErrorClass::Fatal,
            Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::Overloaded
            | Self::Network(_)
            | Self::StreamInterrupted(_) => ErrorClass::Transient,
            Self::Timeout(_) | Self::Cancelled => ErrorClass::Local,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    pub fn is_fatal(&self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    pub fn suggested_delay(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }

    /// Stable snake_case tag for logs and events.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::ContextWindowExceeded { .. } => "context_window_exceeded",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::Overloaded => "overloaded",
            Self::Network(_) => "network_error",
            Self::StreamInterrupted(_) => "stream_interrupted",
            Self::Timeout(_) => "timeout",
            Self::Cancelled => "cancelled",
        }
    }

    /// Map an HTTP error status from a provider endpoint.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            413 => Self::ContextWindowExceeded { limit: 0, actual: 0 },
            429 => Self::RateLimited { retry_after: None },
            529 => Self::Overloaded,
            500..=599 => Self::ServerError { status, body },
            400..=499 => Self::InvalidRequest(body),
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }

    /// Attach a `Retry-After` header value (whole seconds) to a rate limit.
    /// Other errors and unparsable values are returned unchanged.
    pub fn with_retry_after(self, header: Option<&str>) -> Self {
        match (self, header.and_then(|h| h.trim().parse::<u64>().ok())) {
            (Self::RateLimited { .. }, Some(secs)) => Self::RateLimited {
                retry_after: Some(Duration::from_secs(secs)),
            },
            (other, _) => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_drive_retry_and_fatal() {
        let cases = [
            (ProviderError::AuthenticationFailed("revoked".into()), ErrorClass::Fatal),
            (ProviderError::InvalidRequest("schema".into()), ErrorClass::Fatal),
            (ProviderError::RateLimited { retry_after: None }, ErrorClass::Transient),
            (ProviderError::Network("reset".into()), ErrorClass::Transient),
            (ProviderError::StreamInterrupted("eof".into()), ErrorClass::Transient),
            (ProviderError::Timeout(Duration::from_secs(1)), ErrorClass::Local),
            (ProviderError::Cancelled, ErrorClass::Local),
        ];
        for (err, class) in cases {
            assert_eq!(err.class(), class, "{err}");
            assert_eq!(err.is_retryable(), class == ErrorClass::Transient);
            assert_eq!(err.is_fatal(), class == ErrorClass::Fatal);
        }
    }

    #[test]
    fn status_codes_map_to_variants() {
        assert_eq!(ProviderError::from_status(403, "no".into()).error_kind(), "authentication_failed");
        assert_eq!(ProviderError::from_status(413, "big".into()).error_kind(), "context_window_exceeded");
        assert_eq!(ProviderError::from_status(422, "bad".into()).error_kind(), "invalid_request");
        assert_eq!(ProviderError::from_status(429, String::new()).error_kind(), "rate_limited");
        assert_eq!(ProviderError::from_status(529, String::new()).error_kind(), "overloaded");
        assert!(ProviderError::from_status(502, "gateway".into()).is_retryable());
    }

    #[test]
    fn retry_after_header_only_applies_to_rate_limits() {
        let limited = ProviderError::from_status(429, String::new()).with_retry_after(Some(" 12 "));
        assert_eq!(limited.suggested_delay(), Some(Duration::from_secs(12)));

        let garbled = ProviderError::from_status(429, String::new()).with_retry_after(Some("soon"));
        assert_eq!(garbled.suggested_delay(), None);

        let overloaded = ProviderError::Overloaded.with_retry_after(Some("5"));
        assert_eq!(overloaded.suggested_delay(), None);
    }
}
