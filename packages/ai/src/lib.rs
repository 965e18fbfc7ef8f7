// ABOUTME: Language model integration for agent runs
// ABOUTME: Neutral conversation types, the LanguageModel trait and the Anthropic client

#[cfg(any(test, feature = "test-utils"))]
pub mod scripted;
pub mod service;
pub mod types;

pub use service::{AIServiceError, AIServiceResult, AnthropicModel, LanguageModel};
pub use types::{
    first_text, ChatMessage, InferenceRequest, InferenceResponse, MessageContent, OutputMessage,
    Role, ToolCall, ToolSchema, Usage,
};

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::ScriptedModel;
