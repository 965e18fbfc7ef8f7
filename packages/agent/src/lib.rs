// ABOUTME: Durable code-agent orchestration engine
// ABOUTME: Sandbox tools, the single-agent network, post-processing, result commit and run dispatch

pub mod committer;
pub mod function;
pub mod network;
pub mod postprocess;
pub mod prompts;
pub mod state;
pub mod tools;
pub mod trigger;

pub use committer::{ResultCommitter, ERROR_MESSAGE};
pub use function::{AgentSettings, CodeAgentFunction, RunError, RunEvent, RunOutcome};
pub use network::{extract_task_summary, CodeAgentNetwork, NetworkOutcome, NetworkStatus};
pub use postprocess::{PostProcessed, PostProcessor, DEFAULT_RESPONSE, DEFAULT_TITLE};
pub use state::AgentState;
pub use tools::{dispatch, tool_schemas, FileWriteOutcome, RunContext};
pub use trigger::{validate_prompt, RunDispatcher, RunTicket, TriggerError};
