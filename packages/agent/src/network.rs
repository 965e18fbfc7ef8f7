// ABOUTME: Single-agent network loop driving the code agent to completion
// ABOUTME: Alternates durable model turns with tool dispatch until a task summary appears or the turn ceiling is hit

use std::sync::Arc;

use kiln_ai::{ChatMessage, InferenceRequest, InferenceResponse, LanguageModel};
use kiln_workflow::StepError;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::prompts::{CONTINUE_PROMPT, PROMPT, SUMMARY_CLOSE, SUMMARY_OPEN};
use crate::tools::{dispatch, tool_schemas, RunContext};

pub const AGENT_NAME: &str = "code-agent";
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;
pub const AGENT_TEMPERATURE: f32 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkStatus {
    Running,
    Converged,
    Incomplete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkOutcome {
    pub status: NetworkStatus,
    pub iterations: u32,
}

/// Text between the first `<task_summary>` and the following `</task_summary>`.
///
/// An opening marker without a closing one yields everything after it.
pub fn extract_task_summary(text: &str) -> Option<String> {
    let start = text.find(SUMMARY_OPEN)? + SUMMARY_OPEN.len();
    let rest = &text[start..];
    let inner = match rest.find(SUMMARY_CLOSE) {
        Some(end) => &rest[..end],
        None => rest,
    };
    let summary = inner.trim();
    if summary.is_empty() {
        None
    } else {
        Some(summary.to_string())
    }
}

pub struct CodeAgentNetwork {
    model: Arc<dyn LanguageModel>,
    model_name: String,
    max_iterations: u32,
}

impl CodeAgentNetwork {
    pub fn new(model: Arc<dyn LanguageModel>, model_name: String, max_iterations: u32) -> Self {
        Self {
            model,
            model_name,
            max_iterations,
        }
    }

    /// Drive the agent until `run.state.summary` is set or the ceiling is reached
    pub async fn run(
        &self,
        run: &mut RunContext,
        mut conversation: Vec<ChatMessage>,
    ) -> Result<NetworkOutcome, StepError> {
        let tools = tool_schemas();
        let mut iterations = 0;

        while iterations < self.max_iterations {
            if run.state.is_complete() {
                break;
            }
            iterations += 1;

            let request = InferenceRequest {
                model: self.model_name.clone(),
                system: PROMPT.to_string(),
                messages: conversation.clone(),
                tools: tools.clone(),
                temperature: AGENT_TEMPERATURE,
            };
            let model = &self.model;
            let request = &request;
            let response: InferenceResponse = run
                .steps
                .run(AGENT_NAME, || async move { model.infer(request).await })
                .await?;

            debug!(
                "Run {}: agent turn {} returned {} item(s)",
                run.run_id(),
                iterations,
                response.output.len()
            );

            if !run.state.is_complete() {
                if let Some(summary) = response
                    .last_assistant_text()
                    .and_then(|text| extract_task_summary(&text))
                {
                    info!("Run {}: task summary received on turn {}", run.run_id(), iterations);
                    run.state.summary = summary;
                }
            }

            let calls = response.tool_calls();
            conversation.push(ChatMessage::Assistant {
                output: response.output,
            });
            for call in &calls {
                let content = dispatch(run, call).await?;
                conversation.push(ChatMessage::ToolResult {
                    call_id: call.id.clone(),
                    name: call.name.clone(),
                    content,
                });
            }
            // Every request has to end on a user turn
            if calls.is_empty() && !run.state.is_complete() {
                conversation.push(ChatMessage::user(CONTINUE_PROMPT));
            }
        }

        let status = if run.state.is_complete() {
            NetworkStatus::Converged
        } else {
            warn!(
                "Run {}: no task summary after {} turns",
                run.run_id(),
                iterations
            );
            NetworkStatus::Incomplete
        };

        Ok(NetworkOutcome { status, iterations })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_enclosed_summary() {
        let text = "Done!\n<task_summary>\nBuilt a todo app.\n</task_summary>";
        assert_eq!(
            extract_task_summary(text),
            Some("Built a todo app.".to_string())
        );
    }

    #[test]
    fn test_first_marker_wins() {
        let text = "<task_summary>first</task_summary> <task_summary>second</task_summary>";
        assert_eq!(extract_task_summary(text), Some("first".to_string()));
    }

    #[test]
    fn test_unclosed_marker_takes_rest() {
        assert_eq!(
            extract_task_summary("<task_summary> Landing page"),
            Some("Landing page".to_string())
        );
    }

    #[test]
    fn test_missing_or_empty_marker() {
        assert_eq!(extract_task_summary("still working"), None);
        assert_eq!(extract_task_summary("<task_summary></task_summary>"), None);
    }
}
