// ABOUTME: Classifies a finished run and commits its single terminal chat message
// ABOUTME: RESULT messages carry a fragment with the preview URL; every failure becomes one ERROR message

use std::collections::BTreeMap;

use kiln_sandbox::SandboxManager;
use kiln_storage::{
    CreateFragmentInput, CreateMessageInput, Message, MessageRole, MessageStorage, MessageType,
};
use kiln_workflow::{StepContext, StepError};
use tracing::info;

use crate::postprocess::PostProcessed;

pub const ERROR_MESSAGE: &str = "The agent failed to complete the task. Please try again.";

const SANDBOX_URL_STEP: &str = "get-sandbox-url";
const SAVE_STEP: &str = "save-result";

/// Commits through `save-result`; the message insert is keyed on the run id
pub struct ResultCommitter {
    messages: MessageStorage,
}

impl ResultCommitter {
    pub fn new(messages: MessageStorage) -> Self {
        Self { messages }
    }

    async fn save(
        &self,
        steps: &mut StepContext,
        input: CreateMessageInput,
    ) -> Result<Message, StepError> {
        let messages = &self.messages;
        let input = &input;
        steps
            .run(SAVE_STEP, || async move {
                messages.create_message(input.clone()).await
            })
            .await
    }

    /// Persist the ERROR message of a failed run
    pub async fn commit_error(
        &self,
        steps: &mut StepContext,
        project_id: &str,
    ) -> Result<Message, StepError> {
        info!("Run {}: committing ERROR message", steps.run_id());
        let input = CreateMessageInput {
            project_id: project_id.to_string(),
            run_id: Some(steps.run_id().to_string()),
            role: MessageRole::Assistant,
            message_type: MessageType::Error,
            content: ERROR_MESSAGE.to_string(),
            fragment: None,
        };
        self.save(steps, input).await
    }

    /// Resolve the preview URL and persist the RESULT message with its fragment
    pub async fn commit_success(
        &self,
        steps: &mut StepContext,
        sandbox: &SandboxManager,
        sandbox_id: &str,
        project_id: &str,
        files: &BTreeMap<String, String>,
        post: &PostProcessed,
    ) -> Result<(Message, String), StepError> {
        let sandbox_url: String = steps
            .run(SANDBOX_URL_STEP, || async move {
                Ok::<_, std::convert::Infallible>(sandbox.preview_url(sandbox_id))
            })
            .await?;

        info!(
            "Run {}: committing RESULT message with {} file(s) at {}",
            steps.run_id(),
            files.len(),
            sandbox_url
        );
        let input = CreateMessageInput {
            project_id: project_id.to_string(),
            run_id: Some(steps.run_id().to_string()),
            role: MessageRole::Assistant,
            message_type: MessageType::Result,
            content: post.response.clone(),
            fragment: Some(CreateFragmentInput {
                sandbox_url: sandbox_url.clone(),
                title: post.title.clone(),
                files: files.clone(),
            }),
        };
        let message = self.save(steps, input).await?;
        Ok((message, sandbox_url))
    }
}
