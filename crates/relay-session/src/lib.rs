pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod merge;
pub mod service;
pub mod tokens;
pub mod usage;

pub use config::{RateLimitConfig, ServiceConfig, StreamConfig};
pub use context::ConversationContext;
pub use error::{is_cancellation_message, ServiceError};
pub use events::{EventSink, NoopSink, ServiceEvent};
pub use merge::{MergeMode, TextMerger};
pub use service::{LlmService, ServiceRequest, ServiceResponse, TurnState};
pub use tokens::{estimate_tokens, Encoding, TokenCounter};
pub use usage::{ToolCallRecord, UsageAccumulator, UsageBreakdown, UsageSource};
