use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// USD per million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCost {
    pub input: f64,
    pub output: f64,
    #[serde(default)]
    pub cache_read: Option<f64>,
}

impl ModelCost {
    pub fn new(input: f64, output: f64) -> Self {
        Self {
            input,
            output,
            cache_read: None,
        }
    }

    pub fn with_cache_read(mut self, cache_read: f64) -> Self {
        self.cache_read = Some(cache_read);
        self
    }

    /// Cost of one call. Cached input tokens are billed at `cache_read`
    /// when set, otherwise at the input rate.
    pub fn cost(&self, input_tokens: u64, cached_input_tokens: u64, output_tokens: u64) -> f64 {
        let cached = cached_input_tokens.min(input_tokens);
        let uncached = input_tokens - cached;
        let cache_rate = self.cache_read.unwrap_or(self.input);

        (uncached as f64 * self.input
            + cached as f64 * cache_rate
            + output_tokens as f64 * self.output)
            / 1_000_000.0
    }
}

/// Prices keyed by `provider/model`. Lookups fall back to the longest
/// configured key that prefixes the requested one, so `openai/gpt-4o`
/// also prices `openai/gpt-4o-2024-08-06`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    entries: HashMap<String, ModelCost>,
}

impl PricingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, provider: &str, model: &str, cost: ModelCost) {
        self.entries.insert(format!("{provider}/{model}"), cost);
    }

    pub fn with(mut self, provider: &str, model: &str, cost: ModelCost) -> Self {
        self.insert(provider, model, cost);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, provider: &str, model: &str) -> Option<&ModelCost> {
        let key = format!("{provider}/{model}");
        if let Some(cost) = self.entries.get(&key) {
            return Some(cost);
        }
        self.entries
            .iter()
            .filter(|(candidate, _)| key.starts_with(candidate.as_str()))
            .max_by_key(|(candidate, _)| candidate.len())
            .map(|(_, cost)| cost)
    }
}
