use serde::{Deserialize, Serialize};

use crate::{CacheControl, Content, ContextMessage, Role};

/// How a vendor expects the conversation laid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireShape {
    /// Flat `{role, content}` list; system instructions lead as a `system` entry.
    RoleArray,
    /// System instructions in separate cache-annotated blocks; the message
    /// list only holds `user` and `assistant` entries.
    SystemAndMessages,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    pub role: Role,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
    pub cache_control: CacheControl,
}

impl SystemBlock {
    pub fn cached_text(text: impl Into<String>) -> Self {
        Self {
            block_type: "text".to_string(),
            text: text.into(),
            cache_control: CacheControl::ephemeral(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum WirePayload {
    RoleArray {
        messages: Vec<WireMessage>,
    },
    SystemAndMessages {
        system: Vec<SystemBlock>,
        messages: Vec<WireMessage>,
    },
}

impl WirePayload {
    pub fn messages(&self) -> &[WireMessage] {
        match self {
            WirePayload::RoleArray { messages } => messages,
            WirePayload::SystemAndMessages { messages, .. } => messages,
        }
    }

    pub fn system_blocks(&self) -> &[SystemBlock] {
        match self {
            WirePayload::RoleArray { .. } => &[],
            WirePayload::SystemAndMessages { system, .. } => system,
        }
    }
}

fn non_empty(system: Option<&str>) -> Option<&str> {
    system.map(str::trim).filter(|s| !s.is_empty())
}

fn to_wire(message: &ContextMessage) -> WireMessage {
    WireMessage {
        role: message.role,
        content: message.content.clone(),
    }
}

/// Build a vendor payload from conversation messages, in order.
pub fn format_messages(
    messages: &[ContextMessage],
    system: Option<&str>,
    shape: WireShape,
) -> WirePayload {
    let system = non_empty(system);

    match shape {
        WireShape::RoleArray => {
            let mut wire = Vec::with_capacity(messages.len() + 1);
            if let Some(text) = system {
                wire.push(WireMessage {
                    role: Role::System,
                    content: Content::Text(text.to_string()),
                });
            }
            wire.extend(messages.iter().map(to_wire));
            WirePayload::RoleArray { messages: wire }
        }
        WireShape::SystemAndMessages => {
            let mut blocks: Vec<SystemBlock> = system
                .map(|text| SystemBlock::cached_text(text))
                .into_iter()
                .collect();
            let mut wire = Vec::with_capacity(messages.len());
            for message in messages {
                match message.role {
                    Role::System => {
                        let text = message.content.text_lossy();
                        if !text.trim().is_empty() {
                            blocks.push(SystemBlock::cached_text(text.into_owned()));
                        }
                    }
                    Role::User | Role::Assistant => wire.push(to_wire(message)),
                }
            }
            WirePayload::SystemAndMessages {
                system: blocks,
                messages: wire,
            }
        }
    }
}

/// Payload for a stateless call: only `message`, plus system instructions.
pub fn format_single(
    message: &ContextMessage,
    system: Option<&str>,
    shape: WireShape,
) -> WirePayload {
    format_messages(std::slice::from_ref(message), system, shape)
}
