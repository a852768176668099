use relay_core::{define_event, Bus, BusEventDef};
use relay_provider::UsageRecord;
use serde::{Deserialize, Serialize};

use crate::usage::UsageBreakdown;

pub const CHUNK: BusEventDef = define_event("chunk");
pub const REASONING: BusEventDef = define_event("reasoning");
pub const TOOL_START: BusEventDef = define_event("tool_start");
pub const TOOL_END: BusEventDef = define_event("tool_end");
pub const TOOL_ERROR: BusEventDef = define_event("tool_error");
pub const RATE_LIMIT_WAIT: BusEventDef = define_event("rate_limit_wait");
pub const TOKEN_USAGE: BusEventDef = define_event("token_usage");
pub const USAGE_BREAKDOWN: BusEventDef = define_event("usage_breakdown");
pub const ERROR: BusEventDef = define_event("error");

/// Notifications produced while a turn runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceEvent {
    Chunk {
        provider: String,
        model: String,
        text: String,
    },
    Reasoning {
        provider: String,
        model: String,
        text: String,
    },
    ToolStart {
        provider: String,
        model: String,
        call_id: String,
        name: String,
        args: serde_json::Value,
    },
    ToolEnd {
        provider: String,
        model: String,
        call_id: String,
        name: String,
        result: String,
    },
    ToolError {
        provider: String,
        model: String,
        call_id: String,
        name: String,
        error: String,
    },
    RateLimitWait {
        provider: String,
        model: String,
        wait_ms: u64,
        attempt: u32,
    },
    TokenUsage {
        provider: String,
        model: String,
        usage: UsageRecord,
        #[serde(default)]
        best_effort: bool,
    },
    UsageBreakdown {
        provider: String,
        model: String,
        breakdown: UsageBreakdown,
    },
    Error {
        provider: String,
        model: String,
        message: String,
    },
}

impl ServiceEvent {
    pub fn def(&self) -> &'static BusEventDef {
        match self {
            ServiceEvent::Chunk { .. } => &CHUNK,
            ServiceEvent::Reasoning { .. } => &REASONING,
            ServiceEvent::ToolStart { .. } => &TOOL_START,
            ServiceEvent::ToolEnd { .. } => &TOOL_END,
            ServiceEvent::ToolError { .. } => &TOOL_ERROR,
            ServiceEvent::RateLimitWait { .. } => &RATE_LIMIT_WAIT,
            ServiceEvent::TokenUsage { .. } => &TOKEN_USAGE,
            ServiceEvent::UsageBreakdown { .. } => &USAGE_BREAKDOWN,
            ServiceEvent::Error { .. } => &ERROR,
        }
    }

    pub fn event_type(&self) -> &'static str {
        self.def().event_type
    }
}

/// Receives service notifications. Called inline from the streaming loop,
/// so implementations must not block.
pub trait EventSink: Send + Sync {
    fn emit(&self, event: ServiceEvent);
}

impl EventSink for Bus {
    fn emit(&self, event: ServiceEvent) {
        let def = event.def();
        match serde_json::to_value(&event) {
            Ok(properties) => self.publish(def, properties),
            Err(error) => {
                tracing::warn!(
                    %error,
                    event_type = def.event_type,
                    "failed to serialize service event"
                )
            }
        }
    }
}

/// Drops every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl EventSink for NoopSink {
    fn emit(&self, _event: ServiceEvent) {}
}
