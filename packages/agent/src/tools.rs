// ABOUTME: Sandbox tools exposed to the code agent and their dispatch
// ABOUTME: Every invocation runs as a durable step and always yields a string for the model

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use kiln_ai::{ToolCall, ToolSchema};
use kiln_sandbox::SandboxManager;
use kiln_workflow::{StepContext, StepError};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::state::AgentState;

pub const TERMINAL: &str = "terminal";
pub const CREATE_OR_UPDATE_FILE: &str = "createOrUpdateFile";
pub const READ_FILE: &str = "readFile";

const READ_FILE_STEP: &str = "read-file";

/// Everything a tool handler may touch during one run
pub struct RunContext {
    pub project_id: String,
    pub steps: StepContext,
    pub sandbox: Arc<SandboxManager>,
    pub sandbox_id: String,
    pub state: AgentState,
}

impl RunContext {
    pub fn run_id(&self) -> &str {
        self.steps.run_id()
    }
}

#[derive(Debug, Deserialize)]
struct TerminalArgs {
    command: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FileEntry {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Deserialize)]
struct WriteFilesArgs {
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct PathEntry {
    path: String,
}

#[derive(Debug, Deserialize)]
struct ReadFilesArgs {
    files: Vec<PathEntry>,
}

#[derive(Debug, Serialize)]
struct ReadFileResult<'a> {
    path: &'a str,
    content: String,
}

/// Recorded result of a file-write step; `files` includes writes made before any failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileWriteOutcome {
    pub files: BTreeMap<String, String>,
    pub error: Option<String>,
}

pub fn tool_schemas() -> Vec<ToolSchema> {
    vec![
        ToolSchema {
            name: TERMINAL.to_string(),
            description: "Use the terminal to run commands".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "command": { "type": "string" }
                },
                "required": ["command"]
            }),
        },
        ToolSchema {
            name: CREATE_OR_UPDATE_FILE.to_string(),
            description: "Create or update files in the sandbox".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" },
                                "content": { "type": "string" }
                            },
                            "required": ["path", "content"]
                        }
                    }
                },
                "required": ["files"]
            }),
        },
        ToolSchema {
            name: READ_FILE.to_string(),
            description: "Read files from the sandbox".to_string(),
            input_schema: json!({
                "type": "object",
                "properties": {
                    "files": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "path": { "type": "string" }
                            },
                            "required": ["path"]
                        }
                    }
                },
                "required": ["files"]
            }),
        },
    ]
}

fn parse_args<'de, T: Deserialize<'de>>(call: &'de ToolCall) -> Result<T, String> {
    T::deserialize(&call.arguments)
        .map_err(|e| format!("Error : invalid arguments for {}: {}", call.name, e))
}

/// Execute one model-issued tool call; the outer error is reserved for step-log failures
pub async fn dispatch(run: &mut RunContext, call: &ToolCall) -> Result<String, StepError> {
    debug!("Run {}: dispatching tool {}", run.run_id(), call.name);

    match call.name.as_str() {
        TERMINAL => match parse_args::<TerminalArgs>(call) {
            Ok(args) => terminal(run, &args.command).await,
            Err(message) => Ok(message),
        },
        CREATE_OR_UPDATE_FILE => match parse_args::<WriteFilesArgs>(call) {
            Ok(args) => create_or_update_files(run, &args.files).await,
            Err(message) => Ok(message),
        },
        READ_FILE => match parse_args::<ReadFilesArgs>(call) {
            Ok(args) => {
                let paths: Vec<String> = args.files.into_iter().map(|f| f.path).collect();
                read_files(run, &paths).await
            }
            Err(message) => Ok(message),
        },
        unknown => {
            warn!("Run {}: model requested unknown tool {}", run.run_id(), unknown);
            Ok(format!("Error : unknown tool {}", unknown))
        }
    }
}

/// Run a shell command; failures come back as diagnostic text
pub async fn terminal(run: &mut RunContext, command: &str) -> Result<String, StepError> {
    let sandbox: &SandboxManager = &run.sandbox;
    let sandbox_id: &str = &run.sandbox_id;

    run.steps
        .run(TERMINAL, || async move {
            let outcome = sandbox.run_command(sandbox_id, command).await;
            Ok::<_, Infallible>(outcome.into_tool_output())
        })
        .await
}

/// Write files in order, merging each into the state; earlier writes survive a later failure
pub async fn create_or_update_files(
    run: &mut RunContext,
    entries: &[FileEntry],
) -> Result<String, StepError> {
    let sandbox: &SandboxManager = &run.sandbox;
    let sandbox_id: &str = &run.sandbox_id;
    let current = &run.state.files;

    let outcome: FileWriteOutcome = run
        .steps
        .run(CREATE_OR_UPDATE_FILE, || async move {
            let mut files = current.clone();
            for entry in entries {
                if let Err(e) = sandbox.write_file(sandbox_id, &entry.path, &entry.content).await
                {
                    return Ok::<_, Infallible>(FileWriteOutcome {
                        files,
                        error: Some(e.to_string()),
                    });
                }
                files.insert(entry.path.clone(), entry.content.clone());
            }
            Ok(FileWriteOutcome { files, error: None })
        })
        .await?;

    run.state.files = outcome.files;
    match outcome.error {
        Some(error) => {
            warn!("Run {}: file write failed: {}", run.run_id(), error);
            Ok(format!("Error : {}", error))
        }
        None => Ok(serde_json::to_string(&run.state.files).unwrap_or_default()),
    }
}

/// Read files and return them as a JSON list of {path, content}
pub async fn read_files(run: &mut RunContext, paths: &[String]) -> Result<String, StepError> {
    let sandbox: &SandboxManager = &run.sandbox;
    let sandbox_id: &str = &run.sandbox_id;

    run.steps
        .run(READ_FILE_STEP, || async move {
            let mut contents = Vec::with_capacity(paths.len());
            for path in paths {
                match sandbox.read_file(sandbox_id, path).await {
                    Ok(content) => contents.push(ReadFileResult {
                        path: path.as_str(),
                        content,
                    }),
                    Err(e) => return Ok::<_, Infallible>(format!("Error : {}", e)),
                }
            }
            Ok(serde_json::to_string(&contents).unwrap_or_default())
        })
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_sandbox::{MemoryProvider, ScriptedCommand};
    use kiln_workflow::{MemoryStepStore, RetryPolicy, StepExecutor};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    async fn run_context(provider: Arc<MemoryProvider>) -> RunContext {
        let sandbox = Arc::new(SandboxManager::new(
            provider,
            Duration::from_secs(1800),
            3000,
        ));
        let handle = sandbox.create("kiln-nextjs").await.unwrap();
        let executor = StepExecutor::new(Arc::new(MemoryStepStore::new()), RetryPolicy::none());

        RunContext {
            project_id: "proj-1".to_string(),
            steps: executor.context("run-1"),
            sandbox,
            sandbox_id: handle.id,
            state: AgentState::new(),
        }
    }

    fn call(name: &str, arguments: serde_json::Value) -> ToolCall {
        ToolCall {
            id: "call-1".to_string(),
            name: name.to_string(),
            arguments,
        }
    }

    #[tokio::test]
    async fn test_terminal_failure_is_text() {
        let provider = Arc::new(MemoryProvider::new());
        provider.on_command(
            "npm run lint",
            ScriptedCommand::failing(1, "", "Unexpected token"),
        );
        let mut run = run_context(provider).await;

        let output = dispatch(&mut run, &call(TERMINAL, json!({ "command": "npm run lint" })))
            .await
            .unwrap();

        assert!(output.contains("Command failed"));
        assert!(output.contains("Unexpected token"));
    }

    #[tokio::test]
    async fn test_last_write_wins_per_path() {
        let provider = Arc::new(MemoryProvider::new());
        let mut run = run_context(provider.clone()).await;

        for content in ["<h1>one</h1>", "<h1>two</h1>"] {
            let args = json!({ "files": [{ "path": "/index.html", "content": content }] });
            dispatch(&mut run, &call(CREATE_OR_UPDATE_FILE, args))
                .await
                .unwrap();
        }

        assert_eq!(run.state.files["/index.html"], "<h1>two</h1>");
        assert_eq!(
            provider.files(&run.sandbox_id)["/index.html"],
            "<h1>two</h1>"
        );
    }

    #[tokio::test]
    async fn test_partial_writes_are_kept_on_failure() {
        let provider = Arc::new(MemoryProvider::new());
        provider.fail_writes_to("locked.txt");
        let mut run = run_context(provider.clone()).await;

        let args = json!({ "files": [
            { "path": "a.txt", "content": "a" },
            { "path": "locked.txt", "content": "b" },
            { "path": "c.txt", "content": "c" }
        ] });
        let output = dispatch(&mut run, &call(CREATE_OR_UPDATE_FILE, args))
            .await
            .unwrap();

        assert!(output.starts_with("Error : "));
        assert_eq!(run.state.files.keys().collect::<Vec<_>>(), vec!["a.txt"]);
        assert!(provider.files(&run.sandbox_id).contains_key("a.txt"));
        assert!(!provider.files(&run.sandbox_id).contains_key("c.txt"));
    }

    #[tokio::test]
    async fn test_read_files_returns_json_list() {
        let provider = Arc::new(MemoryProvider::new());
        let mut run = run_context(provider).await;
        let write = json!({ "files": [{ "path": "app/page.tsx", "content": "x" }] });
        dispatch(&mut run, &call(CREATE_OR_UPDATE_FILE, write))
            .await
            .unwrap();

        let output = dispatch(
            &mut run,
            &call(READ_FILE, json!({ "files": [{ "path": "app/page.tsx" }] })),
        )
        .await
        .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(parsed, json!([{ "path": "app/page.tsx", "content": "x" }]));

        let missing = dispatch(
            &mut run,
            &call(READ_FILE, json!({ "files": [{ "path": "nope.ts" }] })),
        )
        .await
        .unwrap();
        assert!(missing.starts_with("Error : "));
    }

    #[tokio::test]
    async fn test_unknown_tool_and_bad_arguments_are_text() {
        let provider = Arc::new(MemoryProvider::new());
        let mut run = run_context(provider.clone()).await;

        let unknown = dispatch(&mut run, &call("deploy", json!({}))).await.unwrap();
        assert_eq!(unknown, "Error : unknown tool deploy");

        let malformed = dispatch(&mut run, &call(TERMINAL, json!({ "cmd": "ls" })))
            .await
            .unwrap();
        assert!(malformed.starts_with("Error : invalid arguments for terminal"));
        assert!(provider.executed_commands().is_empty());
    }
}
