use std::time::Duration;

/// Typed error hierarchy for model adapter calls.
/// Nothing in the session retries these; classification is informational
/// for embedding applications that want their own retry policy.
#[derive(Clone, Debug, thiserror::Error)]
pub enum AdapterError {
    // Fatal
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("unsupported: {0}")]
    Unsupported(String),

    // Transient
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),

    // Protocol
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("cancelled")]
    Cancelled,
}

impl AdapterError {
    /// Transient failure an embedding application may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::ProviderOverloaded
                | Self::NetworkError(_)
        )
    }

    /// Failure that will recur until configuration or input changes.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AuthenticationFailed(_) | Self::InvalidRequest(_) | Self::Unsupported(_)
        )
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::Unsupported(_) => "unsupported",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::InvalidResponse(_) => "invalid_response",
            Self::Cancelled => "cancelled",
        }
    }

    /// Classify an HTTP status code into the appropriate error variant.
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::ProviderOverloaded,
            500..=599 => Self::ServerError { status, body },
            _ => Self::InvalidRequest(format!("unexpected status {status}: {body}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(AdapterError::RateLimited { retry_after: None }.is_retryable());
        assert!(AdapterError::ServerError { status: 500, body: "err".into() }.is_retryable());
        assert!(AdapterError::ProviderOverloaded.is_retryable());
        assert!(AdapterError::NetworkError("tcp".into()).is_retryable());
        assert!(!AdapterError::Cancelled.is_retryable());
    }

    #[test]
    fn fatal_classification() {
        assert!(AdapterError::AuthenticationFailed("bad key".into()).is_fatal());
        assert!(AdapterError::InvalidRequest("bad".into()).is_fatal());
        assert!(AdapterError::Unsupported("threading".into()).is_fatal());
        assert!(!AdapterError::InvalidResponse("empty".into()).is_fatal());
    }

    #[test]
    fn from_status_mapping() {
        assert!(AdapterError::from_status(401, "unauthorized".into()).is_fatal());
        assert!(AdapterError::from_status(400, "bad request".into()).is_fatal());
        assert!(AdapterError::from_status(429, "slow down".into()).is_retryable());
        assert!(AdapterError::from_status(529, "overloaded".into()).is_retryable());
        assert!(AdapterError::from_status(502, "bad gateway".into()).is_retryable());
    }

    #[test]
    fn error_kind_strings() {
        assert_eq!(AdapterError::Cancelled.error_kind(), "cancelled");
        assert_eq!(
            AdapterError::RateLimited { retry_after: None }.error_kind(),
            "rate_limited"
        );
    }
}
