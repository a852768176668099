use anyhow::{Context, Result};
use relay_provider::{ModelCost, PricingTable, RetryConfig, Vendor};
use relay_tool::ToolPolicy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Per-vendor override of text de-duplication, keyed by provider id.
    pub dedupe_text: HashMap<String, bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub default_provider: Option<String>,
    /// Provider id to model id.
    pub default_models: HashMap<String, String>,
    pub retry: RetryConfig,
    pub tool_policy: ToolPolicy,
    pub stream: StreamConfig,
    /// Keyed by `provider/model`.
    pub pricing: HashMap<String, ModelCost>,
    pub rate_limit: RateLimitConfig,
}

impl ServiceConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).with_context(|| "Failed to parse service config")
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        tracing::debug!(path = %path.display(), "loaded service config");
        Ok(config)
    }

    /// Configured model for `vendor`, else the vendor default.
    pub fn default_model(&self, vendor: Vendor) -> String {
        self.default_models
            .iter()
            .find(|(provider, _)| Vendor::from_id(provider) == Some(vendor))
            .map(|(_, model)| model.clone())
            .unwrap_or_else(|| vendor.default_model().to_string())
    }

    /// Whether streamed text for `vendor` goes through overlap suppression.
    pub fn dedupe_text(&self, vendor: Vendor) -> bool {
        self.stream
            .dedupe_text
            .iter()
            .find(|(provider, _)| Vendor::from_id(provider) == Some(vendor))
            .map(|(_, enabled)| *enabled)
            .unwrap_or_else(|| vendor.resends_accumulated_text())
    }

    pub fn pricing_table(&self) -> PricingTable {
        let mut table = PricingTable::new();
        for (key, cost) in &self.pricing {
            match key.split_once('/') {
                Some((provider, model)) => table.insert(provider, model, cost.clone()),
                None => tracing::warn!(key = %key, "pricing key is not provider/model, ignoring"),
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = r#"
default_provider = "anthropic"

[default_models]
anthropic = "claude-3-5-haiku-20241022"

[retry]
max_attempts = 5
max_cumulative_wait_ms = 10000

[tool_policy]
dedupe = true
max_calls_per_file = 2

[stream.dedupe_text]
openai = true

[pricing."openai/gpt-4o"]
input = 2.5
output = 10.0
cache_read = 1.25

[rate_limit]
requests_per_minute = 30
"#;

    #[test]
    fn test_parse_full_config() {
        let config = ServiceConfig::from_toml_str(SAMPLE).unwrap();

        assert_eq!(config.default_provider.as_deref(), Some("anthropic"));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.initial_delay_ms, 2000);
        assert!(config.tool_policy.dedupe);
        assert_eq!(config.tool_policy.max_calls_per_file, Some(2));
        assert_eq!(config.rate_limit.requests_per_minute, Some(30));
        assert_eq!(
            config.default_model(Vendor::Anthropic),
            "claude-3-5-haiku-20241022"
        );
        assert_eq!(config.default_model(Vendor::OpenAi), "gpt-4o");

        let pricing = config.pricing_table();
        let cost = pricing.lookup("openai", "gpt-4o").unwrap();
        assert_eq!(cost.cache_read, Some(1.25));
    }

    #[test]
    fn test_dedupe_text_defaults_follow_vendor() {
        let config = ServiceConfig::from_toml_str(SAMPLE).unwrap();
        assert!(config.dedupe_text(Vendor::OpenAi));
        assert!(config.dedupe_text(Vendor::Gemini));
        assert!(!config.dedupe_text(Vendor::Anthropic));
    }

    #[test]
    fn test_empty_config_is_default() {
        let config = ServiceConfig::from_toml_str("").unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = ServiceConfig::load_from_file(file.path()).unwrap();
        assert_eq!(config.retry.max_cumulative_wait_ms, 10_000);
    }

    #[test]
    fn test_invalid_file_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"retry = 3").unwrap();

        let err = ServiceConfig::load_from_file(file.path()).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to parse config file"));
    }
}
