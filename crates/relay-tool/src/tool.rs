use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub type Metadata = HashMap<String, serde_json::Value>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub title: String,
    pub output: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl ToolResult {
    pub fn simple(title: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            output: output.into(),
            metadata: Metadata::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}

#[derive(Clone, Debug)]
pub struct ToolContext {
    pub call_id: Option<String>,
    pub abort: CancellationToken,
    pub extra: HashMap<String, serde_json::Value>,
}

impl ToolContext {
    pub fn new(abort: CancellationToken) -> Self {
        Self {
            call_id: None,
            abort,
            extra: HashMap::new(),
        }
    }

    pub fn with_call_id(mut self, call_id: impl Into<String>) -> Self {
        self.call_id = Some(call_id.into());
        self
    }
}

impl Default for ToolContext {
    fn default() -> Self {
        Self::new(CancellationToken::new())
    }
}

/// Schema description of a tool as sent to a vendor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: Option<String>,
    pub parameters: serde_json::Value,
}

#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> &str;
    fn description(&self) -> &str;
    fn parameters(&self) -> serde_json::Value;

    async fn execute(
        &self,
        args: serde_json::Value,
        ctx: ToolContext,
    ) -> Result<ToolResult, ToolError>;

    fn validate(&self, args: &serde_json::Value) -> Result<(), ToolError> {
        let _ = args;
        Ok(())
    }

    fn definition(&self) -> ToolDefinition {
        let description = self.description();
        ToolDefinition {
            name: self.id().to_string(),
            description: (!description.is_empty()).then(|| description.to_string()),
            parameters: self.parameters(),
        }
    }
}

pub fn definitions(tools: &[Arc<dyn Tool>]) -> Vec<ToolDefinition> {
    tools.iter().map(|t| t.definition()).collect()
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ToolError {
    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    /// Call cap reached for a signature or file. Display text is stable.
    #[error("{0}")]
    ReadLocked(String),

    #[error("Cancelled")]
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Tool for Echo {
        fn id(&self) -> &str {
            "echo"
        }

        fn description(&self) -> &str {
            ""
        }

        fn parameters(&self) -> serde_json::Value {
            serde_json::json!({"type": "object"})
        }

        async fn execute(
            &self,
            args: serde_json::Value,
            _ctx: ToolContext,
        ) -> Result<ToolResult, ToolError> {
            Ok(ToolResult::simple("echo", args.to_string()))
        }
    }

    #[test]
    fn test_definition_omits_empty_description() {
        let def = Echo.definition();
        assert_eq!(def.name, "echo");
        assert!(def.description.is_none());
        assert_eq!(def.parameters["type"], "object");
    }

    #[tokio::test]
    async fn test_execute_round_trip() {
        let result = Echo
            .execute(serde_json::json!({"a": 1}), ToolContext::default())
            .await
            .unwrap();
        assert_eq!(result.output, r#"{"a":1}"#);
        assert_eq!(result.title, "echo");
    }
}
