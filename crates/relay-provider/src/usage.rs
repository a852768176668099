use serde::{Deserialize, Serialize};
use std::ops::AddAssign;

/// Input-side token categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InputBreakdown {
    pub system: u64,
    pub tool_definitions: u64,
    pub user: u64,
    pub assistant: u64,
    pub tool_results: u64,
    pub response_schema: u64,
}

impl InputBreakdown {
    pub fn total(&self) -> u64 {
        self.system
            + self.tool_definitions
            + self.user
            + self.assistant
            + self.tool_results
            + self.response_schema
    }
}

impl AddAssign<&InputBreakdown> for InputBreakdown {
    fn add_assign(&mut self, rhs: &InputBreakdown) {
        self.system = self.system.saturating_add(rhs.system);
        self.tool_definitions = self.tool_definitions.saturating_add(rhs.tool_definitions);
        self.user = self.user.saturating_add(rhs.user);
        self.assistant = self.assistant.saturating_add(rhs.assistant);
        self.tool_results = self.tool_results.saturating_add(rhs.tool_results);
        self.response_schema = self.response_schema.saturating_add(rhs.response_schema);
    }
}

/// Output-side token categories.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputBreakdown {
    pub text: u64,
    pub reasoning: u64,
    pub tool_calls: u64,
}

impl OutputBreakdown {
    pub fn total(&self) -> u64 {
        self.text + self.reasoning + self.tool_calls
    }
}

impl AddAssign<&OutputBreakdown> for OutputBreakdown {
    fn add_assign(&mut self, rhs: &OutputBreakdown) {
        self.text = self.text.saturating_add(rhs.text);
        self.reasoning = self.reasoning.saturating_add(rhs.reasoning);
        self.tool_calls = self.tool_calls.saturating_add(rhs.tool_calls);
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepBreakdown {
    pub input: InputBreakdown,
    pub output: OutputBreakdown,
}

impl AddAssign<&StepBreakdown> for StepBreakdown {
    fn add_assign(&mut self, rhs: &StepBreakdown) {
        self.input += &rhs.input;
        self.output += &rhs.output;
    }
}

/// Usage as reported by a provider for one streaming step. Depending on
/// the vendor the numbers are either running totals for the whole turn or
/// fresh per-step values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cached_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub breakdown: Option<StepBreakdown>,
}

impl UsageRecord {
    pub fn new(input_tokens: u64, output_tokens: u64) -> Self {
        Self {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens.saturating_add(output_tokens),
            ..Default::default()
        }
    }

    pub fn with_total(mut self, total_tokens: u64) -> Self {
        self.total_tokens = total_tokens;
        self
    }

    pub fn with_cached(mut self, cached_input_tokens: u64) -> Self {
        self.cached_input_tokens = Some(cached_input_tokens);
        self
    }

    pub fn with_reasoning(mut self, reasoning_tokens: u64) -> Self {
        self.reasoning_tokens = Some(reasoning_tokens);
        self
    }

    pub fn with_step(mut self, step: u32) -> Self {
        self.step = Some(step);
        self
    }

    pub fn with_breakdown(mut self, breakdown: StepBreakdown) -> Self {
        self.breakdown = Some(breakdown);
        self
    }
}
