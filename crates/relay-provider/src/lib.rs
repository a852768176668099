pub mod auth;
pub mod message;
pub mod models;
pub mod provider;
pub mod rate_limit;
pub mod retry;
pub mod sampling;
pub mod stream;
pub mod transform;
pub mod usage;

pub use auth::{CredentialSource, CredentialStore};
pub use message::*;
pub use models::{ModelCost, PricingTable};
pub use provider::*;
pub use rate_limit::{RateLimitInfo, RateLimiter, SlidingWindowLimiter};
pub use retry::{sleep_with_cancel, with_retries, IsRetryable, RetryConfig, SleepCancelled};
pub use sampling::{
    resolve_sampling, supports_thinking, ReasoningEffort, ResolvedSampling, SamplingDefaults,
    SamplingOverrides, DEFAULT_THINKING_BUDGET,
};
pub use stream::*;
pub use transform::{
    format_messages, format_single, SystemBlock, WireMessage, WirePayload, WireShape,
};
pub use usage::*;
