//! Reconciles provider-reported usage across the steps of one turn.
//!
//! Providers report usage either as running totals for the whole turn or as
//! fresh per-step values, and some switch between the two mid-turn. Each
//! record is compared with the previous one: a total that did not shrink is
//! read as cumulative and reduced to a delta, a total that shrank starts a
//! new step and is taken as-is. Only deltas are ever summed, so nothing is
//! counted twice.

use relay_provider::{InputBreakdown, ModelCost, OutputBreakdown, StepBreakdown, UsageRecord};
use serde::{Deserialize, Serialize};

use crate::tokens::TokenCounter;

/// One tool invocation seen during a turn. Kept for accounting only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub name: String,
    pub call_id: String,
    pub args: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

/// Where the numbers of a [`UsageBreakdown`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageSource {
    Accumulated,
    LastReported,
    Estimated,
}

/// Final per-turn usage report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageBreakdown {
    pub source: UsageSource,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
    pub cached_input_tokens: u64,
    /// Reported reasoning tokens, or output not explained by text and tool calls.
    pub thoughts_tokens: u64,
    pub input: InputBreakdown,
    pub output: OutputBreakdown,
    pub steps: u32,
    pub tool_calls: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
}

#[derive(Debug, Default)]
pub struct UsageAccumulator {
    previous: Option<UsageRecord>,
    totals: UsageRecord,
    reported_reasoning: bool,
    emitted: bool,
    steps: u32,
    step_totals: StepBreakdown,
    tool_calls: Vec<ToolCallRecord>,
}

fn delta(previous: &UsageRecord, current: &UsageRecord) -> UsageRecord {
    let total_delta = current.total_tokens.saturating_sub(previous.total_tokens);
    let input = current
        .input_tokens
        .saturating_sub(previous.input_tokens)
        .min(total_delta);
    let output = total_delta - input;

    let option_delta = |now: Option<u64>, before: Option<u64>| {
        now.map(|n| n.saturating_sub(before.unwrap_or(0)))
    };

    UsageRecord {
        input_tokens: input,
        output_tokens: output,
        total_tokens: total_delta,
        cached_input_tokens: option_delta(
            current.cached_input_tokens,
            previous.cached_input_tokens,
        ),
        reasoning_tokens: option_delta(current.reasoning_tokens, previous.reasoning_tokens),
        step: current.step,
        breakdown: current.breakdown,
    }
}

fn is_zero(record: &UsageRecord) -> bool {
    record.input_tokens == 0
        && record.output_tokens == 0
        && record.total_tokens == 0
        && record.cached_input_tokens.unwrap_or(0) == 0
        && record.reasoning_tokens.unwrap_or(0) == 0
}

impl UsageAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds a provider report into the running totals. Returns the delta to
    /// emit, or `None` when the report adds nothing.
    pub fn record_provider_usage(&mut self, record: UsageRecord) -> Option<UsageRecord> {
        let previous_total = self.previous.as_ref().map_or(0, |p| p.total_tokens);

        let step = if record.total_tokens >= previous_total {
            let baseline = self.previous.clone().unwrap_or_default();
            delta(&baseline, &record)
        } else {
            tracing::debug!(
                previous_total,
                total = record.total_tokens,
                "usage total decreased, treating report as a new step"
            );
            record.clone()
        };

        if record.reasoning_tokens.is_some() {
            self.reported_reasoning = true;
        }
        self.previous = Some(record);

        if is_zero(&step) {
            return None;
        }
        self.add(&step);
        self.emitted = true;
        Some(step)
    }

    pub fn record_step_usage(&mut self, breakdown: &StepBreakdown) {
        self.steps += 1;
        self.step_totals += breakdown;
    }

    pub fn record_tool_call(&mut self, call: ToolCallRecord) {
        self.tool_calls.push(call);
    }

    /// Attaches a result to the matching call, if one was recorded.
    pub fn record_tool_result(&mut self, call_id: &str, result: impl Into<String>) {
        if let Some(call) = self
            .tool_calls
            .iter_mut()
            .rev()
            .find(|call| call.call_id == call_id)
        {
            call.result = Some(result.into());
        }
    }

    pub fn tool_calls(&self) -> &[ToolCallRecord] {
        &self.tool_calls
    }

    /// Token counts of tool-call arguments and tool results.
    pub fn tool_io_tokens(&self, counter: &TokenCounter) -> (u64, u64) {
        self.tool_calls.iter().fold((0, 0), |(args, results), call| {
            let arg_tokens = counter.count(&call.args.to_string());
            let result_tokens = call.result.as_deref().map_or(0, |r| counter.count(r));
            (args + arg_tokens, results + result_tokens)
        })
    }

    pub fn accumulated_totals(&self) -> &UsageRecord {
        &self.totals
    }

    pub fn last_reported(&self) -> Option<&UsageRecord> {
        self.previous.as_ref()
    }

    pub fn has_emitted(&self) -> bool {
        self.emitted
    }

    /// A usage estimate for a turn that ended before the provider reported
    /// anything. Produced at most once, and never after real usage was emitted.
    pub fn best_effort_usage(
        &mut self,
        approx_input: u64,
        approx_output: u64,
    ) -> Option<UsageRecord> {
        if self.emitted {
            return None;
        }
        self.emitted = true;
        let record = UsageRecord::new(approx_input, approx_output);
        if is_zero(&record) {
            return None;
        }
        self.add(&record);
        Some(record)
    }

    fn add(&mut self, step: &UsageRecord) {
        let totals = &mut self.totals;
        totals.input_tokens = totals.input_tokens.saturating_add(step.input_tokens);
        totals.output_tokens = totals.output_tokens.saturating_add(step.output_tokens);
        totals.total_tokens = totals.total_tokens.saturating_add(step.total_tokens);
        if let Some(cached) = step.cached_input_tokens {
            totals.cached_input_tokens = Some(totals.cached_input_tokens.unwrap_or(0) + cached);
        }
        if let Some(reasoning) = step.reasoning_tokens {
            totals.reasoning_tokens = Some(totals.reasoning_tokens.unwrap_or(0) + reasoning);
        }
    }

    /// The turn's usage report.
    ///
    /// Numbers come from the accumulated totals, else the last single report,
    /// else `local`, an estimate computed from the payload and the streamed
    /// output. Input categories come from provider step breakdowns when any
    /// were reported, otherwise from `local`.
    pub fn final_breakdown(
        &self,
        local: &StepBreakdown,
        pricing: Option<&ModelCost>,
    ) -> UsageBreakdown {
        let last = self.previous.as_ref().filter(|r| !is_zero(r));
        let (source, input, output, total, cached, reasoning) = if !is_zero(&self.totals) {
            let t = &self.totals;
            (
                UsageSource::Accumulated,
                t.input_tokens,
                t.output_tokens,
                t.total_tokens,
                t.cached_input_tokens,
                t.reasoning_tokens,
            )
        } else if let Some(r) = last {
            (
                UsageSource::LastReported,
                r.input_tokens,
                r.output_tokens,
                r.total_tokens,
                r.cached_input_tokens,
                r.reasoning_tokens,
            )
        } else {
            let input = local.input.total();
            let output = local.output.total();
            (UsageSource::Estimated, input, output, input + output, None, None)
        };

        let explained = local.output.text.saturating_add(local.output.tool_calls);
        let thoughts_tokens = match reasoning {
            Some(reported) if self.reported_reasoning => reported,
            _ => output.saturating_sub(explained),
        };
        let cached_input_tokens = cached.unwrap_or(0);

        let input_breakdown = if self.steps > 0 {
            self.step_totals.input
        } else {
            local.input
        };
        let mut output_breakdown = local.output;
        output_breakdown.reasoning = thoughts_tokens;

        UsageBreakdown {
            source,
            input_tokens: input,
            output_tokens: output,
            total_tokens: total,
            cached_input_tokens,
            thoughts_tokens,
            input: input_breakdown,
            output: output_breakdown,
            steps: self.steps,
            tool_calls: self.tool_calls.len(),
            cost: pricing.map(|p| p.cost(input, cached_input_tokens, output)),
        }
    }
}
