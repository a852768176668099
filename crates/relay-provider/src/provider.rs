use async_trait::async_trait;
use relay_tool::{Tool, ToolDefinition};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::{ResolvedSampling, ResponseSchema, StreamHandle, WirePayload, WireShape};

/// The closed set of vendor families the service can talk to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Vendor {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "anthropic")]
    Anthropic,
    #[serde(rename = "gemini")]
    Gemini,
}

impl Vendor {
    pub const ALL: [Vendor; 3] = [Vendor::OpenAi, Vendor::Anthropic, Vendor::Gemini];

    pub fn from_id(id: &str) -> Option<Self> {
        match id.trim().to_lowercase().as_str() {
            "openai" => Some(Vendor::OpenAi),
            "anthropic" | "claude" => Some(Vendor::Anthropic),
            "gemini" | "google" => Some(Vendor::Gemini),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Anthropic => "anthropic",
            Vendor::Gemini => "gemini",
        }
    }

    pub fn wire_shape(&self) -> WireShape {
        match self {
            Vendor::Anthropic => WireShape::SystemAndMessages,
            Vendor::OpenAi | Vendor::Gemini => WireShape::RoleArray,
        }
    }

    /// Factor applied to a normalized 0–1 temperature.
    pub fn temperature_scale(&self) -> f32 {
        match self {
            Vendor::Anthropic => 1.0,
            Vendor::OpenAi | Vendor::Gemini => 2.0,
        }
    }

    /// Whether streamed text fragments may repeat text already sent.
    pub fn resends_accumulated_text(&self) -> bool {
        matches!(self, Vendor::Gemini)
    }

    pub fn default_model(&self) -> &'static str {
        match self {
            Vendor::OpenAi => "gpt-4o",
            Vendor::Anthropic => "claude-sonnet-4-20250514",
            Vendor::Gemini => "gemini-2.5-flash",
        }
    }

    pub fn credential_env_vars(&self) -> &'static [&'static str] {
        match self {
            Vendor::OpenAi => &["OPENAI_API_KEY"],
            Vendor::Anthropic => &["ANTHROPIC_API_KEY"],
            Vendor::Gemini => &["GEMINI_API_KEY", "GOOGLE_API_KEY"],
        }
    }
}

impl fmt::Display for Vendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    #[error("Rate limit exceeded: {message}")]
    RateLimited {
        message: String,
        retry_after_ms: Option<u64>,
    },

    #[error("API error (status {status}): {message}")]
    ApiError { status: u16, message: String },

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Authentication error: {0}")]
    AuthError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Invalid response schema: {0}")]
    InvalidResponseSchema(String),

    #[error("Timeout")]
    Timeout,

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn rate_limited(message: impl Into<String>, retry_after_ms: Option<u64>) -> Self {
        ProviderError::RateLimited {
            message: message.into(),
            retry_after_ms,
        }
    }

    pub fn api_error(status: u16, message: impl Into<String>) -> Self {
        if status == 429 {
            return Self::rate_limited(message, None);
        }
        ProviderError::ApiError {
            status,
            message: message.into(),
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ProviderError::RateLimited { .. })
    }
}

impl crate::retry::IsRetryable for ProviderError {
    fn is_retryable(&self) -> Option<String> {
        match self {
            ProviderError::RateLimited { message, .. } => Some(format!("Rate limited: {message}")),
            ProviderError::Timeout => Some("Request timed out".to_string()),
            ProviderError::NetworkError(msg) => Some(format!("Network error: {msg}")),
            ProviderError::StreamError(msg) => Some(format!("Stream error: {msg}")),
            ProviderError::ApiError { status, message } => {
                if matches!(status, 500 | 502 | 503 | 504 | 529) {
                    Some(format!("API error {status}: {message}"))
                } else {
                    None
                }
            }
            ProviderError::AuthError(_)
            | ProviderError::InvalidResponseSchema(_)
            | ProviderError::Cancelled => None,
        }
    }

    fn retry_after_ms(&self) -> Option<u64> {
        match self {
            ProviderError::RateLimited { retry_after_ms, .. } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<crate::retry::SleepCancelled> for ProviderError {
    fn from(_: crate::retry::SleepCancelled) -> Self {
        ProviderError::Cancelled
    }
}

/// Everything a vendor adapter needs to open one streaming call.
#[derive(Clone)]
pub struct AdapterRequest {
    pub credential: String,
    pub model: String,
    pub sampling: ResolvedSampling,
    pub payload: WirePayload,
    pub tools: Vec<Arc<dyn Tool>>,
    pub response_schema: Option<ResponseSchema>,
    pub abort: CancellationToken,
}

impl AdapterRequest {
    pub fn tool_definitions(&self) -> Vec<ToolDefinition> {
        relay_tool::tool::definitions(&self.tools)
    }
}

impl fmt::Debug for AdapterRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tools: Vec<&str> = self.tools.iter().map(|t| t.id()).collect();
        f.debug_struct("AdapterRequest")
            .field("model", &self.model)
            .field("sampling", &self.sampling)
            .field("payload", &self.payload)
            .field("tools", &tools)
            .field("response_schema", &self.response_schema)
            .finish_non_exhaustive()
    }
}

/// One vendor's streaming transport.
///
/// The adapter runs any tool-calling loop itself and reports progress
/// through [`crate::StreamEvent`]s on the returned handle.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn vendor(&self) -> Vendor;

    async fn stream(&self, request: AdapterRequest) -> Result<StreamHandle, ProviderError>;
}

/// One optional adapter slot per vendor.
#[derive(Clone, Default)]
pub struct AdapterSet {
    openai: Option<Arc<dyn ProviderAdapter>>,
    anthropic: Option<Arc<dyn ProviderAdapter>>,
    gemini: Option<Arc<dyn ProviderAdapter>>,
}

impl AdapterSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(adapter);
        self
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        let slot = match adapter.vendor() {
            Vendor::OpenAi => &mut self.openai,
            Vendor::Anthropic => &mut self.anthropic,
            Vendor::Gemini => &mut self.gemini,
        };
        *slot = Some(adapter);
    }

    pub fn get(&self, vendor: Vendor) -> Option<&Arc<dyn ProviderAdapter>> {
        match vendor {
            Vendor::OpenAi => self.openai.as_ref(),
            Vendor::Anthropic => self.anthropic.as_ref(),
            Vendor::Gemini => self.gemini.as_ref(),
        }
    }

    pub fn vendors(&self) -> Vec<Vendor> {
        Vendor::ALL
            .into_iter()
            .filter(|v| self.get(*v).is_some())
            .collect()
    }
}

impl fmt::Debug for AdapterSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterSet")
            .field("vendors", &self.vendors())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::IsRetryable;

    struct Idle(Vendor);

    #[async_trait]
    impl ProviderAdapter for Idle {
        fn vendor(&self) -> Vendor {
            self.0
        }

        async fn stream(&self, _request: AdapterRequest) -> Result<StreamHandle, ProviderError> {
            Err(ProviderError::Cancelled)
        }
    }

    #[test]
    fn test_vendor_detection() {
        assert_eq!(Vendor::from_id("anthropic"), Some(Vendor::Anthropic));
        assert_eq!(Vendor::from_id("Claude"), Some(Vendor::Anthropic));
        assert_eq!(Vendor::from_id("google"), Some(Vendor::Gemini));
        assert_eq!(Vendor::from_id(" openai "), Some(Vendor::OpenAi));
        assert_eq!(Vendor::from_id("mistral"), None);
    }

    #[test]
    fn test_vendor_round_trips_through_id() {
        for vendor in Vendor::ALL {
            assert_eq!(Vendor::from_id(vendor.id()), Some(vendor));
        }
    }

    #[test]
    fn test_only_anthropic_separates_system() {
        assert_eq!(Vendor::Anthropic.wire_shape(), WireShape::SystemAndMessages);
        assert_eq!(Vendor::OpenAi.wire_shape(), WireShape::RoleArray);
        assert_eq!(Vendor::Gemini.wire_shape(), WireShape::RoleArray);
    }

    #[test]
    fn test_retryable_classification() {
        assert!(ProviderError::rate_limited("slow down", Some(5))
            .is_retryable()
            .is_some());
        assert!(ProviderError::api_error(503, "overloaded")
            .is_retryable()
            .is_some());
        assert!(ProviderError::api_error(400, "bad").is_retryable().is_none());
        assert!(ProviderError::AuthError("nope".into())
            .is_retryable()
            .is_none());
        assert!(ProviderError::Cancelled.is_retryable().is_none());
    }

    #[test]
    fn test_status_429_maps_to_rate_limited() {
        let err = ProviderError::api_error(429, "too many");
        assert!(err.is_rate_limit());
        assert_eq!(err.retry_after_ms(), None);
    }

    #[test]
    fn test_adapter_set_slots() {
        let set = AdapterSet::new()
            .with(Arc::new(Idle(Vendor::Gemini)))
            .with(Arc::new(Idle(Vendor::Anthropic)));

        assert!(set.get(Vendor::OpenAi).is_none());
        assert_eq!(
            set.get(Vendor::Gemini).map(|a| a.vendor()),
            Some(Vendor::Gemini)
        );
        assert_eq!(set.vendors(), vec![Vendor::Anthropic, Vendor::Gemini]);
    }
}
