// ABOUTME: Language model abstraction and the Anthropic Messages API backend
// ABOUTME: Translates neutral conversations and tool schemas into Anthropic requests and back

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::types::{
    ChatMessage, InferenceRequest, InferenceResponse, MessageContent, OutputMessage, Role, Usage,
};

pub const ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Calculate appropriate max_tokens for a given model
fn get_max_tokens_for_model(model: &str) -> u32 {
    if model.contains("claude-3-haiku") {
        1024
    } else if model.contains("claude-3-5-haiku") || model.contains("claude-haiku") {
        2048
    } else if model.contains("claude-3-opus") || model.contains("claude-3-sonnet") {
        4096
    } else if model.contains("claude-sonnet") || model.contains("claude-opus") {
        8192
    } else {
        4096
    }
}

#[derive(Debug, Error)]
pub enum AIServiceError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),

    #[error("No API key configured")]
    NoApiKey,

    #[error("Invalid response format")]
    InvalidResponse,
}

pub type AIServiceResult<T> = Result<T, AIServiceError>;

/// A model that turns a conversation into output items
#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn infer(&self, request: &InferenceRequest) -> AIServiceResult<InferenceResponse>;
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    temperature: f32,
    messages: Vec<AnthropicMessage>,
    #[serde(skip_serializing_if = "String::is_empty")]
    system: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    tools: Vec<AnthropicTool>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: &'static str,
    content: Vec<RequestBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RequestBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
    },
}

#[derive(Debug, Serialize)]
struct AnthropicTool {
    name: String,
    description: String,
    input_schema: JsonValue,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<ResponseBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ResponseBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: JsonValue,
    },
    #[serde(other)]
    Other,
}

/// Convert the neutral history into alternating Anthropic turns
fn to_anthropic_messages(messages: &[ChatMessage]) -> Vec<AnthropicMessage> {
    let mut turns: Vec<AnthropicMessage> = Vec::new();

    for message in messages {
        let (role, blocks) = match message {
            ChatMessage::User { content } => ("user", text_block(content)),
            ChatMessage::Assistant { output } => {
                let blocks = output
                    .iter()
                    .flat_map(|item| match item {
                        OutputMessage::Text { content, .. } => text_block(&content.to_text()),
                        OutputMessage::ToolCall {
                            id,
                            name,
                            arguments,
                        } => vec![RequestBlock::ToolUse {
                            id: id.clone(),
                            name: name.clone(),
                            input: arguments.clone(),
                        }],
                    })
                    .collect();
                ("assistant", blocks)
            }
            ChatMessage::ToolResult {
                call_id, content, ..
            } => (
                "user",
                vec![RequestBlock::ToolResult {
                    tool_use_id: call_id.clone(),
                    content: content.clone(),
                }],
            ),
        };

        if blocks.is_empty() {
            continue;
        }
        match turns.last_mut() {
            Some(last) if last.role == role => last.content.extend(blocks),
            _ => turns.push(AnthropicMessage {
                role,
                content: blocks,
            }),
        }
    }

    // The API requires the conversation to open with a user turn
    while turns.first().is_some_and(|turn| turn.role == "assistant") {
        debug!("Dropping leading assistant turn from history");
        turns.remove(0);
    }

    turns
}

fn text_block(text: &str) -> Vec<RequestBlock> {
    if text.trim().is_empty() {
        Vec::new()
    } else {
        vec![RequestBlock::Text {
            text: text.to_string(),
        }]
    }
}

/// Anthropic Messages API backend
pub struct AnthropicModel {
    client: Client,
    api_key: Option<String>,
    api_url: String,
}

impl AnthropicModel {
    /// Create HTTP client with timeout configuration
    fn create_client() -> AIServiceResult<Client> {
        Ok(Client::builder()
            .timeout(Duration::from_secs(600))
            .connect_timeout(Duration::from_secs(10))
            .build()?)
    }

    pub fn new(api_key: Option<String>) -> AIServiceResult<Self> {
        Self::with_api_url(api_key, ANTHROPIC_API_URL.to_string())
    }

    pub fn with_api_url(api_key: Option<String>, api_url: String) -> AIServiceResult<Self> {
        if api_key.is_none() {
            info!("ANTHROPIC_API_KEY not set - model calls will fail until configured");
        }
        Ok(Self {
            client: Self::create_client()?,
            api_key,
            api_url,
        })
    }
}

#[async_trait]
impl LanguageModel for AnthropicModel {
    async fn infer(&self, request: &InferenceRequest) -> AIServiceResult<InferenceResponse> {
        let api_key = self.api_key.as_ref().ok_or(AIServiceError::NoApiKey)?;

        let body = AnthropicRequest {
            model: request.model.clone(),
            max_tokens: get_max_tokens_for_model(&request.model),
            temperature: request.temperature,
            messages: to_anthropic_messages(&request.messages),
            system: request.system.clone(),
            tools: request
                .tools
                .iter()
                .map(|tool| AnthropicTool {
                    name: tool.name.clone(),
                    description: tool.description.clone(),
                    input_schema: tool.input_schema.clone(),
                })
                .collect(),
        };

        info!(
            "Making Anthropic API request: model={}, messages={}, tools={}",
            body.model,
            body.messages.len(),
            body.tools.len()
        );

        let response = self
            .client
            .post(&self.api_url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    error!("Anthropic API request timed out after 600 seconds");
                    AIServiceError::ApiError("Request timed out after 600 seconds".to_string())
                } else if e.is_connect() {
                    error!("Failed to connect to Anthropic API: {}", e);
                    AIServiceError::ApiError(format!("Connection failed: {}", e))
                } else {
                    error!("Anthropic API request failed: {}", e);
                    AIServiceError::RequestFailed(e)
                }
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            error!("Anthropic API error: {} - {}", status, error_text);
            return Err(AIServiceError::ApiError(format!(
                "API returned {}: {}",
                status, error_text
            )));
        }

        let anthropic_response: AnthropicResponse = response
            .json()
            .await
            .map_err(|e| AIServiceError::ParseError(e.to_string()))?;

        debug!(
            "Anthropic response: blocks={}, stop_reason={:?}",
            anthropic_response.content.len(),
            anthropic_response.stop_reason
        );

        let output = anthropic_response
            .content
            .into_iter()
            .filter_map(|block| match block {
                ResponseBlock::Text { text } => Some(OutputMessage::Text {
                    role: Role::Assistant,
                    content: MessageContent::Text(text),
                }),
                ResponseBlock::ToolUse { id, name, input } => Some(OutputMessage::ToolCall {
                    id,
                    name,
                    arguments: input,
                }),
                ResponseBlock::Other => None,
            })
            .collect();

        Ok(InferenceResponse {
            output,
            usage: anthropic_response.usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_tool_results_merge_into_one_user_turn() {
        let history = vec![
            ChatMessage::user("build a todo app"),
            ChatMessage::Assistant {
                output: vec![
                    OutputMessage::ToolCall {
                        id: "a".to_string(),
                        name: "terminal".to_string(),
                        arguments: json!({"command": "ls"}),
                    },
                    OutputMessage::ToolCall {
                        id: "b".to_string(),
                        name: "readFiles".to_string(),
                        arguments: json!({"files": []}),
                    },
                ],
            },
            ChatMessage::ToolResult {
                call_id: "a".to_string(),
                name: "terminal".to_string(),
                content: "app".to_string(),
            },
            ChatMessage::ToolResult {
                call_id: "b".to_string(),
                name: "readFiles".to_string(),
                content: "[]".to_string(),
            },
        ];

        let turns = to_anthropic_messages(&history);
        let roles: Vec<&str> = turns.iter().map(|t| t.role).collect();
        assert_eq!(roles, vec!["user", "assistant", "user"]);
        assert_eq!(turns[2].content.len(), 2);
    }

    #[test]
    fn test_leading_assistant_turn_is_dropped() {
        let history = vec![
            ChatMessage::assistant_text("Here you go"),
            ChatMessage::user("make it blue"),
        ];

        let turns = to_anthropic_messages(&history);
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].role, "user");
    }

    #[test]
    fn test_max_tokens_by_model_family() {
        assert_eq!(get_max_tokens_for_model("claude-3-haiku-20240307"), 1024);
        assert_eq!(get_max_tokens_for_model("claude-3-5-haiku-20241022"), 2048);
        assert_eq!(get_max_tokens_for_model("claude-sonnet-4-20250514"), 8192);
    }
}
