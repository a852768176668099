use once_cell::sync::Lazy;
use regex::Regex;
use relay_provider::ProviderError;

static CANCELLATION_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)cancel|abort|terminat|stop").unwrap());

/// Whether an error message reads as a caller-initiated cancellation.
pub fn is_cancellation_message(message: &str) -> bool {
    CANCELLATION_PATTERN.is_match(message)
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ServiceError {
    #[error("No provider configured for this request")]
    UnknownProvider,

    #[error("No API key available for provider: {0}")]
    MissingCredential(String),

    #[error("Unsupported provider: {0}")]
    UnsupportedProvider(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Invalid response schema: {0}")]
    InvalidResponseSchema(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ServiceError {
    pub fn is_cancellation(&self) -> bool {
        matches!(self, ServiceError::Cancelled) || is_cancellation_message(&self.to_string())
    }
}

impl From<ProviderError> for ServiceError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::RateLimited { message, .. } => ServiceError::RateLimited(message),
            ProviderError::Cancelled => ServiceError::Cancelled,
            ProviderError::InvalidResponseSchema(message) => {
                ServiceError::InvalidResponseSchema(message)
            }
            other => ServiceError::StreamError(other.to_string()),
        }
    }
}
