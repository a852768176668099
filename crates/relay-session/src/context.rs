use relay_provider::{
    Content, ContextMessage, ReasoningEffort, Role, SamplingDefaults, SamplingOverrides,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A conversation owned by the caller. The service only reads it and
/// appends to it; existing entries are never reordered or removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversationContext {
    pub messages: Vec<ContextMessage>,
    pub provider: Option<String>,
    pub model: Option<String>,
    pub system_instructions: Option<String>,
    /// Sampling overrides keyed by model id.
    pub model_overrides: HashMap<String, SamplingOverrides>,
    /// Normalized 0–1.
    pub temperature: Option<f32>,
    pub reasoning_effort: Option<ReasoningEffort>,
}

impl ConversationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, provider: impl Into<String>, model: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self.model = Some(model.into());
        self
    }

    pub fn with_system_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.system_instructions = Some(instructions.into());
        self
    }

    pub fn with_message(mut self, message: ContextMessage) -> Self {
        self.messages.push(message);
        self
    }

    /// Appends a user message unless the last entry already is an equal one.
    /// Returns whether anything was appended.
    pub fn append_user_message(&mut self, content: Content) -> bool {
        let duplicate = self
            .messages
            .last()
            .is_some_and(|last| last.role == Role::User && last.content.same_as(&content));
        if duplicate {
            return false;
        }
        self.messages.push(ContextMessage::user(content));
        true
    }

    pub fn append_assistant_message(&mut self, text: impl Into<String>, reasoning: Option<String>) {
        let mut message = ContextMessage::assistant(text.into());
        if let Some(reasoning) = reasoning {
            message = message.with_reasoning(reasoning);
        }
        self.messages.push(message);
    }

    pub fn sampling_defaults(&self) -> SamplingDefaults {
        SamplingDefaults {
            temperature: self.temperature,
            reasoning_effort: self.reasoning_effort,
        }
    }

    pub fn overrides_for(&self, model: &str) -> Option<&SamplingOverrides> {
        self.model_overrides.get(model)
    }
}
