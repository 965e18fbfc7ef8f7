// ABOUTME: Provider-neutral conversation, tool and inference types
// ABOUTME: Model output is a tagged Text | Parts content with a single normalization path

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Text content as returned by a model: a single string or a list of parts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<String>),
}

impl MessageContent {
    /// Flatten to one string; parts are concatenated without separators
    pub fn to_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Parts(parts) => parts.concat(),
        }
    }
}

impl From<&str> for MessageContent {
    fn from(text: &str) -> Self {
        Self::Text(text.to_string())
    }
}

impl From<String> for MessageContent {
    fn from(text: String) -> Self {
        Self::Text(text)
    }
}

/// One item of model output
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutputMessage {
    Text {
        role: Role,
        content: MessageContent,
    },
    ToolCall {
        id: String,
        name: String,
        arguments: JsonValue,
    },
}

/// Conversation history entry sent to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChatMessage {
    User {
        content: String,
    },
    Assistant {
        output: Vec<OutputMessage>,
    },
    ToolResult {
        call_id: String,
        name: String,
        content: String,
    },
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self::User {
            content: content.into(),
        }
    }

    pub fn assistant_text(content: impl Into<String>) -> Self {
        Self::Assistant {
            output: vec![OutputMessage::Text {
                role: Role::Assistant,
                content: MessageContent::Text(content.into()),
            }],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    /// JSON Schema of the arguments object
    pub input_schema: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Vec<ToolSchema>,
    pub temperature: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
}

impl Usage {
    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub output: Vec<OutputMessage>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

/// Tool invocation extracted from a response
#[derive(Debug, Clone, PartialEq)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: JsonValue,
}

impl InferenceResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            output: vec![OutputMessage::Text {
                role: Role::Assistant,
                content: MessageContent::Text(content.into()),
            }],
            usage: None,
        }
    }

    /// Text of the last assistant text item, if any
    pub fn last_assistant_text(&self) -> Option<String> {
        self.output.iter().rev().find_map(|item| match item {
            OutputMessage::Text {
                role: Role::Assistant,
                content,
            } => Some(content.to_text()),
            _ => None,
        })
    }

    pub fn tool_calls(&self) -> Vec<ToolCall> {
        self.output
            .iter()
            .filter_map(|item| match item {
                OutputMessage::ToolCall {
                    id,
                    name,
                    arguments,
                } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    arguments: arguments.clone(),
                }),
                _ => None,
            })
            .collect()
    }
}

/// Text of the first output item when it is non-empty text
pub fn first_text(output: &[OutputMessage]) -> Option<String> {
    match output.first() {
        Some(OutputMessage::Text { content, .. }) => {
            let text = content.to_text();
            if text.trim().is_empty() {
                None
            } else {
                Some(text)
            }
        }
        _ => None,
    }
}
