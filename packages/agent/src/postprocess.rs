// ABOUTME: Post-processing of a finished run into a fragment title and a user-facing reply
// ABOUTME: Two tool-less durable model calls over the task summary with fixed fallbacks

use std::sync::Arc;

use kiln_ai::{first_text, ChatMessage, InferenceRequest, InferenceResponse, LanguageModel};
use kiln_workflow::{StepContext, StepError};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::prompts::{FRAGMENT_TITLE_PROMPT, RESPONSE_PROMPT};

pub const DEFAULT_TITLE: &str = "Fragment";
pub const DEFAULT_RESPONSE: &str = "Here you go";

const TITLE_STEP: &str = "fragment-title-generator";
const RESPONSE_STEP: &str = "response-generator";
const TEMPERATURE: f32 = 0.3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PostProcessed {
    pub title: String,
    pub response: String,
}

impl Default for PostProcessed {
    fn default() -> Self {
        Self {
            title: DEFAULT_TITLE.to_string(),
            response: DEFAULT_RESPONSE.to_string(),
        }
    }
}

pub struct PostProcessor {
    model: Arc<dyn LanguageModel>,
    model_name: String,
}

impl PostProcessor {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: String) -> Self {
        Self { model, model_name }
    }

    async fn generate(
        &self,
        steps: &mut StepContext,
        step: &str,
        system: &str,
        summary: &str,
    ) -> Result<Option<String>, StepError> {
        let request = InferenceRequest {
            model: self.model_name.clone(),
            system: system.to_string(),
            messages: vec![ChatMessage::user(summary)],
            tools: Vec::new(),
            temperature: TEMPERATURE,
        };
        let model = &self.model;
        let request = &request;

        let response: InferenceResponse = steps
            .run(step, || async move { model.infer(request).await })
            .await?;

        Ok(first_text(&response.output).map(|text| text.trim().to_string()))
    }

    /// Title and reply for `summary`, falling back to the defaults on non-text output
    pub async fn run(
        &self,
        steps: &mut StepContext,
        summary: &str,
    ) -> Result<PostProcessed, StepError> {
        let title = self
            .generate(steps, TITLE_STEP, FRAGMENT_TITLE_PROMPT, summary)
            .await?
            .unwrap_or_else(|| DEFAULT_TITLE.to_string());
        let response = self
            .generate(steps, RESPONSE_STEP, RESPONSE_PROMPT, summary)
            .await?
            .unwrap_or_else(|| DEFAULT_RESPONSE.to_string());

        debug!("Run {}: generated title {:?}", steps.run_id(), title);
        Ok(PostProcessed { title, response })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_ai::{MessageContent, OutputMessage, Role, ScriptedModel};
    use kiln_workflow::{MemoryStepStore, RetryPolicy, StepExecutor};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn steps() -> StepContext {
        StepExecutor::new(Arc::new(MemoryStepStore::new()), RetryPolicy::none()).context("run-1")
    }

    #[tokio::test]
    async fn test_parts_are_joined_into_title() {
        let model = Arc::new(ScriptedModel::new());
        model
            .route(
                "title",
                InferenceResponse {
                    output: vec![OutputMessage::Text {
                        role: Role::Assistant,
                        content: MessageContent::Parts(vec!["Todo".into(), " App".into()]),
                    }],
                    usage: None,
                },
            )
            .route("final agent", InferenceResponse::text("I built a todo app."));
        let processor = PostProcessor::new(model.clone(), "haiku".to_string());

        let result = processor.run(&mut steps(), "Built a todo app").await.unwrap();

        assert_eq!(result.title, "Todo App");
        assert_eq!(result.response, "I built a todo app.");
        assert!(model.requests().iter().all(|r| r.tools.is_empty()));
    }

    #[tokio::test]
    async fn test_non_text_output_falls_back() {
        let model = Arc::new(ScriptedModel::new());
        model.fallback(InferenceResponse {
            output: vec![OutputMessage::ToolCall {
                id: "x".to_string(),
                name: "terminal".to_string(),
                arguments: json!({}),
            }],
            usage: None,
        });
        let processor = PostProcessor::new(model, "haiku".to_string());

        let result = processor.run(&mut steps(), "Built a todo app").await.unwrap();
        assert_eq!(result, PostProcessed::default());
    }
}
