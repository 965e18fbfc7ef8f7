// ABOUTME: Wiring between configuration, storage, sandbox backend, models and the run dispatcher
// ABOUTME: Shared by the kiln binary and its tests so both assemble runs the same way

use std::sync::Arc;

use anyhow::{anyhow, Result};
use kiln_agent::{AgentSettings, CodeAgentFunction, RunDispatcher};
use kiln_ai::{AnthropicModel, LanguageModel};
use kiln_config::Config;
use kiln_sandbox::{E2BProvider, SandboxManager, SandboxProvider};
use kiln_storage::{
    open_pool, MessageStorage, ProjectStorage, RunStorage, StepRecordStorage, UsageStorage,
};
use kiln_workflow::{RetryPolicy, StepExecutor};
use sqlx::SqlitePool;
use tracing::info;

/// Initialize structured logging; `RUST_LOG` overrides the default level
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_target(false)
        .compact()
        .with_writer(std::io::stderr)
        .init();
}

/// Storage handles over one pool
#[derive(Clone)]
pub struct Stores {
    pub pool: SqlitePool,
    pub projects: ProjectStorage,
    pub messages: MessageStorage,
    pub runs: RunStorage,
    pub usage: UsageStorage,
}

impl Stores {
    pub async fn open(database_url: &str) -> Result<Self> {
        let pool = open_pool(database_url).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            projects: ProjectStorage::new(pool.clone()),
            messages: MessageStorage::new(pool.clone()),
            runs: RunStorage::new(pool.clone()),
            usage: UsageStorage::new(pool.clone()),
            pool,
        }
    }
}

pub fn agent_settings(config: &Config) -> AgentSettings {
    AgentSettings {
        template: config.sandbox_template.clone(),
        agent_model: config.agent_model.clone(),
        postprocess_model: config.postprocess_model.clone(),
        max_iterations: config.max_iterations,
        history_limit: config.history_limit,
    }
}

/// Assemble a dispatcher from explicit backends
pub fn build_dispatcher(
    config: &Config,
    stores: &Stores,
    provider: Arc<dyn SandboxProvider>,
    agent_model: Arc<dyn LanguageModel>,
    postprocess_model: Arc<dyn LanguageModel>,
) -> RunDispatcher {
    let sandbox = Arc::new(SandboxManager::new(
        provider,
        config.sandbox_timeout,
        config.preview_port,
    ));
    let steps = StepExecutor::new(
        Arc::new(StepRecordStorage::new(stores.pool.clone())),
        RetryPolicy::new(config.step_max_attempts, config.step_backoff),
    );
    let function = CodeAgentFunction::new(
        steps,
        sandbox,
        stores.messages.clone(),
        agent_model,
        postprocess_model,
        agent_settings(config),
    );

    RunDispatcher::new(
        stores.projects.clone(),
        stores.messages.clone(),
        stores.runs.clone(),
        stores.usage.clone(),
        Arc::new(function),
    )
}

/// Assemble a dispatcher backed by E2B and Anthropic
pub fn connect_dispatcher(config: &Config, stores: &Stores) -> Result<RunDispatcher> {
    let api_key = config
        .e2b
        .api_key
        .clone()
        .ok_or_else(|| anyhow!("E2B_API_KEY is not set"))?;
    let provider = E2BProvider::new(
        api_key,
        Some(config.e2b.api_url.clone()),
        Some(config.e2b.domain.clone()),
    )?;
    let model: Arc<dyn LanguageModel> = Arc::new(AnthropicModel::with_api_url(
        config.anthropic_api_key.clone(),
        config.anthropic_api_url.clone(),
    )?);
    info!(
        "Using E2B at {} (template {}), agent model {}",
        config.e2b.api_url, config.sandbox_template, config.agent_model
    );

    Ok(build_dispatcher(
        config,
        stores,
        Arc::new(provider),
        model.clone(),
        model,
    ))
}
