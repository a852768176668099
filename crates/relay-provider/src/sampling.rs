use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::Vendor;

/// Thinking budget used when thinking is switched on automatically.
pub const DEFAULT_THINKING_BUDGET: u32 = 8192;

static ANTHROPIC_THINKING_MODELS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)claude-(3-7-sonnet|(opus|sonnet|haiku)-[4-9])").unwrap());

static GEMINI_THINKING_MODELS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)gemini-(2\.5|[3-9](\.\d+)?)-").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReasoningEffort {
    Minimal,
    Low,
    Medium,
    High,
}

/// Per-model overrides stored alongside a conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingOverrides {
    /// Vendor-native temperature, used verbatim.
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub thinking_budget: Option<u32>,
    pub include_thoughts: Option<bool>,
}

/// Conversation-wide defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingDefaults {
    /// Normalized to 0–1 regardless of vendor.
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSampling {
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
    pub include_thoughts: bool,
    pub thinking_budget: Option<u32>,
}

/// Whether `model` is treated as thinking-capable. Decided from the model
/// name alone.
pub fn supports_thinking(vendor: Vendor, model: &str) -> bool {
    match vendor {
        Vendor::Anthropic => ANTHROPIC_THINKING_MODELS.is_match(model),
        Vendor::Gemini => GEMINI_THINKING_MODELS.is_match(model),
        Vendor::OpenAi => false,
    }
}

fn native_temperature(vendor: Vendor, normalized: f32) -> Option<f32> {
    if !normalized.is_finite() {
        return None;
    }
    Some(normalized.clamp(0.0, 1.0) * vendor.temperature_scale())
}

/// Effective sampling parameters for one call.
///
/// Reasoning effort: request, then model override, then conversation default.
/// Temperature: model override verbatim, else the normalized default mapped
/// into the vendor's range.
pub fn resolve_sampling(
    vendor: Vendor,
    model: &str,
    defaults: &SamplingDefaults,
    model_override: Option<&SamplingOverrides>,
    request_effort: Option<ReasoningEffort>,
) -> ResolvedSampling {
    let reasoning_effort = request_effort
        .or_else(|| model_override.and_then(|o| o.reasoning_effort))
        .or(defaults.reasoning_effort);

    let temperature = match model_override.and_then(|o| o.temperature) {
        Some(t) => Some(t),
        None => defaults
            .temperature
            .and_then(|t| native_temperature(vendor, t)),
    };

    let explicit_include = model_override.and_then(|o| o.include_thoughts);
    let budget_override = model_override.and_then(|o| o.thinking_budget);

    let include_thoughts = match explicit_include {
        Some(include) => include,
        None => supports_thinking(vendor, model),
    };
    let thinking_budget = if include_thoughts {
        Some(budget_override.unwrap_or(DEFAULT_THINKING_BUDGET))
    } else {
        None
    };

    ResolvedSampling {
        temperature,
        reasoning_effort,
        include_thoughts,
        thinking_budget,
    }
}
