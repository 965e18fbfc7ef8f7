// ABOUTME: Entry points that validate prompts, consume credits and start background runs
// ABOUTME: Creates projects and follow-up messages, spawns one tokio task per run and resumes unfinished runs

use std::sync::Arc;

use chrono::{DateTime, Utc};
use kiln_storage::{
    CreateMessageInput, MessageStorage, Plan, Project, ProjectStorage, QuotaOutcome, RunRecord,
    RunStatus, RunStorage, StorageError, UsageStorage, GENERATION_COST,
};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::function::{CodeAgentFunction, RunError, RunEvent, RunOutcome};

pub const MAX_PROMPT_CHARS: usize = 1000;

#[derive(Error, Debug)]
pub enum TriggerError {
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Project not found: {0}")]
    ProjectNotFound(String),

    #[error("You have run out of credits; they reset at {resets_at}")]
    QuotaExceeded { resets_at: DateTime<Utc> },

    #[error("Usage check failed: {0}")]
    Quota(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
}

/// A started run and the task executing it
pub struct RunTicket {
    pub run: RunRecord,
    pub handle: JoinHandle<Result<RunOutcome, RunError>>,
}

pub fn validate_prompt(prompt: &str) -> Result<(), TriggerError> {
    if prompt.trim().is_empty() {
        return Err(TriggerError::InvalidPrompt("Prompt is required".to_string()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(TriggerError::InvalidPrompt(format!(
            "Prompt is too long (max {} characters)",
            MAX_PROMPT_CHARS
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct RunDispatcher {
    projects: ProjectStorage,
    messages: MessageStorage,
    runs: RunStorage,
    usage: UsageStorage,
    function: Arc<CodeAgentFunction>,
}

impl RunDispatcher {
    pub fn new(
        projects: ProjectStorage,
        messages: MessageStorage,
        runs: RunStorage,
        usage: UsageStorage,
        function: Arc<CodeAgentFunction>,
    ) -> Self {
        Self {
            projects,
            messages,
            runs,
            usage,
            function,
        }
    }

    async fn consume_credit(&self, user_id: &str, plan: Plan) -> Result<(), TriggerError> {
        match self.usage.consume(user_id, plan, GENERATION_COST).await {
            QuotaOutcome::Ok { remaining, .. } => {
                info!("User {} has {} credit(s) left", user_id, remaining);
                Ok(())
            }
            QuotaOutcome::Exhausted { resets_at } => {
                warn!("User {} is out of credits until {}", user_id, resets_at);
                Err(TriggerError::QuotaExceeded { resets_at })
            }
            QuotaOutcome::Failure(reason) => Err(TriggerError::Quota(reason)),
        }
    }

    /// Start a new project from its first prompt
    pub async fn create_project(
        &self,
        user_id: &str,
        plan: Plan,
        prompt: &str,
    ) -> Result<(Project, RunTicket), TriggerError> {
        validate_prompt(prompt)?;
        self.consume_credit(user_id, plan).await?;

        let project = self.projects.create_project(user_id, prompt).await?;
        let run = self.runs.create_run(&project.id, prompt).await?;
        info!("Project {} created, run {} queued", project.id, run.id);

        Ok((project, self.submit(run)))
    }

    /// Post a follow-up prompt to an existing project owned by `user_id`
    pub async fn send_message(
        &self,
        user_id: &str,
        plan: Plan,
        project_id: &str,
        prompt: &str,
    ) -> Result<RunTicket, TriggerError> {
        validate_prompt(prompt)?;
        let project = match self.projects.get_project(project_id).await {
            Ok(project) if project.user_id == user_id => project,
            Ok(_) | Err(StorageError::NotFound(_)) => {
                return Err(TriggerError::ProjectNotFound(project_id.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        self.consume_credit(user_id, plan).await?;

        self.messages
            .create_message(CreateMessageInput::user(&project.id, prompt))
            .await?;
        let run = self.runs.create_run(&project.id, prompt).await?;
        info!("Run {} queued for project {}", run.id, project.id);

        Ok(self.submit(run))
    }

    /// Execute `run` on its own task, tracking its status
    pub fn submit(&self, run: RunRecord) -> RunTicket {
        let runs = self.runs.clone();
        let function = self.function.clone();
        let run_id = run.id.clone();
        let event = RunEvent {
            value: run.prompt.clone(),
            project_id: run.project_id.clone(),
        };

        let handle = tokio::spawn(async move {
            if let Err(e) = runs.update_status(&run_id, RunStatus::Running, None).await {
                warn!("Run {}: could not mark running: {}", run_id, e);
            }

            let result = function.run(&run_id, &event).await;
            let (status, reason) = match &result {
                Ok(outcome) if outcome.is_error => (RunStatus::Failed, None),
                Ok(_) => (RunStatus::Completed, None),
                Err(e) => {
                    error!("Run {}: failed without a committed message: {}", run_id, e);
                    (RunStatus::Failed, Some(e.to_string()))
                }
            };
            if let Err(e) = runs.update_status(&run_id, status, reason.as_deref()).await {
                warn!("Run {}: could not record final status: {}", run_id, e);
            }
            result
        });

        RunTicket { run, handle }
    }

    /// Restart every run that was queued or running when the process stopped
    pub async fn resume_pending(&self) -> Result<Vec<RunTicket>, TriggerError> {
        let pending = self.runs.list_unfinished().await?;
        if !pending.is_empty() {
            info!("Resuming {} unfinished run(s)", pending.len());
        }
        Ok(pending.into_iter().map(|run| self.submit(run)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_validation() {
        assert!(matches!(
            validate_prompt("   "),
            Err(TriggerError::InvalidPrompt(_))
        ));
        assert!(validate_prompt("build a todo app").is_ok());
        assert!(validate_prompt(&"é".repeat(MAX_PROMPT_CHARS)).is_ok());
        assert!(matches!(
            validate_prompt(&"a".repeat(MAX_PROMPT_CHARS + 1)),
            Err(TriggerError::InvalidPrompt(_))
        ));
    }
}
