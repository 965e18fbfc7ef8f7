// ABOUTME: The code-agent run function tying sandbox, network, post-processing and commit together
// ABOUTME: Replays completed steps on re-invocation and routes every fatal error into one ERROR message

use std::collections::BTreeMap;
use std::sync::Arc;

use kiln_ai::{ChatMessage, LanguageModel};
use kiln_sandbox::{SandboxError, SandboxHandle, SandboxManager};
use kiln_storage::{Message, MessageRole, MessageStorage, MessageType};
use kiln_workflow::{StepContext, StepError, StepExecutor};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info};

use crate::committer::ResultCommitter;
use crate::network::{CodeAgentNetwork, NetworkStatus, DEFAULT_MAX_ITERATIONS};
use crate::postprocess::{PostProcessed, PostProcessor, DEFAULT_TITLE};
use crate::state::AgentState;
use crate::tools::RunContext;

const SANDBOX_STEP: &str = "get-sandbox-id";
const HISTORY_STEP: &str = "get-previous-messages";
const DEFAULT_HISTORY_LIMIT: i64 = 5;

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Step execution failed: {0}")]
    Step(#[from] StepError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),
}

/// Inbound trigger of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunEvent {
    /// The user's prompt
    pub value: String,
    pub project_id: String,
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub template: String,
    pub agent_model: String,
    pub postprocess_model: String,
    pub max_iterations: u32,
    pub history_limit: i64,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            template: "kiln-nextjs".to_string(),
            agent_model: "claude-sonnet-4-20250514".to_string(),
            postprocess_model: "claude-3-5-haiku-20241022".to_string(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }
}

/// What a finished run produced, alongside its committed message
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunOutcome {
    pub message: Message,
    pub is_error: bool,
    pub url: Option<String>,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: String,
}

pub struct CodeAgentFunction {
    steps: StepExecutor,
    sandbox: Arc<SandboxManager>,
    messages: MessageStorage,
    network: CodeAgentNetwork,
    post: PostProcessor,
    committer: ResultCommitter,
    settings: AgentSettings,
}

impl CodeAgentFunction {
    pub fn new(
        steps: StepExecutor,
        sandbox: Arc<SandboxManager>,
        messages: MessageStorage,
        agent_model: Arc<dyn LanguageModel>,
        postprocess_model: Arc<dyn LanguageModel>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            network: CodeAgentNetwork::new(
                agent_model,
                settings.agent_model.clone(),
                settings.max_iterations,
            ),
            post: PostProcessor::new(postprocess_model, settings.postprocess_model.clone()),
            committer: ResultCommitter::new(messages.clone()),
            steps,
            sandbox,
            messages,
            settings,
        }
    }

    /// Execute (or resume) run `run_id`; exactly one assistant message is committed
    pub async fn run(&self, run_id: &str, event: &RunEvent) -> Result<RunOutcome, RunError> {
        info!("Run {}: starting for project {}", run_id, event.project_id);

        match self.execute(self.steps.context(run_id), event).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                error!("Run {}: aborted: {}", run_id, e);
                let mut steps = self.steps.context(run_id);
                let message = self
                    .committer
                    .commit_error(&mut steps, &event.project_id)
                    .await?;
                Ok(RunOutcome {
                    message,
                    is_error: true,
                    url: None,
                    title: DEFAULT_TITLE.to_string(),
                    files: BTreeMap::new(),
                    summary: String::new(),
                })
            }
        }
    }

    async fn open_sandbox(&self, steps: &mut StepContext) -> Result<SandboxHandle, RunError> {
        let sandbox = &self.sandbox;
        let template = self.settings.template.as_str();
        let mut created = false;

        let handle: SandboxHandle = steps
            .run(SANDBOX_STEP, || {
                created = true;
                async move { sandbox.create(template).await }
            })
            .await?;

        if created {
            return Ok(handle);
        }
        // Replayed: reattach to the recorded sandbox instead of provisioning another
        Ok(self.sandbox.lookup(&handle.id).await?)
    }

    async fn load_history(
        &self,
        steps: &mut StepContext,
        project_id: &str,
    ) -> Result<Vec<ChatMessage>, RunError> {
        let messages = &self.messages;
        let limit = self.settings.history_limit;

        let history: Vec<ChatMessage> = steps
            .run(HISTORY_STEP, || async move {
                messages
                    .find_recent_messages(project_id, limit)
                    .await
                    .map(|recent| recent.into_iter().map(to_chat_message).collect::<Vec<_>>())
            })
            .await?;
        Ok(history)
    }

    async fn execute(
        &self,
        mut steps: StepContext,
        event: &RunEvent,
    ) -> Result<RunOutcome, RunError> {
        let handle = self.open_sandbox(&mut steps).await?;
        let mut conversation = self.load_history(&mut steps, &event.project_id).await?;

        // The triggering prompt is usually the newest stored message already
        let already_seeded = matches!(
            conversation.last(),
            Some(ChatMessage::User { content }) if content == &event.value
        );
        if !already_seeded {
            conversation.push(ChatMessage::user(event.value.clone()));
        }

        let mut run = RunContext {
            project_id: event.project_id.clone(),
            steps,
            sandbox: self.sandbox.clone(),
            sandbox_id: handle.id.clone(),
            state: AgentState::new(),
        };
        let network = self.network.run(&mut run, conversation).await?;

        if network.status == NetworkStatus::Incomplete || run.state.is_error() {
            info!(
                "Run {}: classified as error after {} turn(s) ({} file(s), summary {})",
                run.run_id(),
                network.iterations,
                run.state.files.len(),
                if run.state.summary.is_empty() { "missing" } else { "present" }
            );
            let message = self
                .committer
                .commit_error(&mut run.steps, &run.project_id)
                .await?;
            return Ok(RunOutcome {
                message,
                is_error: true,
                url: None,
                title: DEFAULT_TITLE.to_string(),
                files: run.state.files,
                summary: run.state.summary,
            });
        }

        let post: PostProcessed = self.post.run(&mut run.steps, &run.state.summary).await?;
        let (message, url) = self
            .committer
            .commit_success(
                &mut run.steps,
                &self.sandbox,
                &run.sandbox_id,
                &run.project_id,
                &run.state.files,
                &post,
            )
            .await?;

        info!("Run {}: completed with fragment {:?}", run.run_id(), post.title);
        Ok(RunOutcome {
            is_error: message.message_type == MessageType::Error,
            message,
            url: Some(url),
            title: post.title,
            files: run.state.files,
            summary: run.state.summary,
        })
    }
}

fn to_chat_message(message: Message) -> ChatMessage {
    match message.role {
        MessageRole::Assistant => ChatMessage::assistant_text(message.content),
        MessageRole::User => ChatMessage::user(message.content),
    }
}
