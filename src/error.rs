//! Error types for the provider ensemble

use std::time::Duration;
use thiserror::Error;

/// Result type alias for ensemble operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the provider ensemble
#[derive(Debug, Error)]
pub enum Error {
    /// Provider is unusable (not registered, disabled, malformed input)
    #[error("Provider error: {provider}: {message}")]
    Provider { provider: String, message: String },

    /// Provider call short-circuited because its breaker is open
    #[error("Circuit breaker open for provider {0}")]
    CircuitOpen(String),

    /// Admission denied by a rate limiter
    #[error("Rate limit exceeded for {limiter}: retry after {}ms", .retry_after.as_millis())]
    RateLimitExceeded {
        limiter: String,
        retry_after: Duration,
    },

    /// A queued request was not granted in time
    #[error("Rate limit queue timeout for {limiter} after {}ms", .waited.as_millis())]
    QueueTimeout { limiter: String, waited: Duration },

    /// Analysis failed, either for one provider or for the whole ensemble
    #[error("Analysis error: {0}")]
    Analysis(String),

    /// A provider call exceeded its time budget
    #[error("Provider {provider} timed out after {}ms", .timeout.as_millis())]
    Timeout { provider: String, timeout: Duration },

    /// No pricing registered for a provider
    #[error("No cost configuration for provider {0}")]
    MissingCostConfig(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a provider error
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// Create an analysis error
    pub fn analysis(msg: impl Into<String>) -> Self {
        Self::Analysis(msg.into())
    }

    /// Create a rate limit error
    pub fn rate_limited(limiter: impl Into<String>, retry_after: Duration) -> Self {
        Self::RateLimitExceeded {
            limiter: limiter.into(),
            retry_after,
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an other error
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }

    /// Whether this error came from admission control
    pub fn is_rate_limit(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::QueueTimeout { .. }
        )
    }

    /// Suggested wait before retrying, when the error carries one
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimitExceeded { retry_after, .. } => Some(*retry_after),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limit_accessors() {
        let err = Error::rate_limited("openai", Duration::from_millis(1500));
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after(), Some(Duration::from_millis(1500)));
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for openai: retry after 1500ms"
        );
    }

    #[test]
    fn test_non_rate_limit_errors() {
        let err = Error::analysis("boom");
        assert!(!err.is_rate_limit());
        assert_eq!(err.retry_after(), None);
        assert_eq!(err.to_string(), "Analysis error: boom");

        let err = Error::provider("claude", "not registered");
        assert_eq!(err.to_string(), "Provider error: claude: not registered");
    }
}
