// ABOUTME: End-to-end run tests with an in-memory sandbox, scripted models and in-memory SQLite
// ABOUTME: Covers success, incomplete and failed runs, replay and crash resumption, and quota rejection

use std::sync::Arc;
use std::time::Duration;

use kiln_agent::prompts::CONTINUE_PROMPT;
use kiln_agent::{
    AgentSettings, CodeAgentFunction, RunDispatcher, RunEvent, TriggerError, ERROR_MESSAGE,
};
use kiln_ai::{ChatMessage, InferenceResponse, OutputMessage, ScriptedModel};
use kiln_sandbox::{MemoryProvider, SandboxManager, ScriptedCommand};
use kiln_storage::{
    open_in_memory, MessageRole, MessageStorage, MessageType, Plan, ProjectStorage, QuotaOutcome,
    RunStatus, RunStorage, StepRecordStorage, UsageStorage,
};
use kiln_workflow::{RetryPolicy, StepExecutor};
use pretty_assertions::assert_eq;
use serde_json::json;
use sqlx::SqlitePool;

struct Harness {
    pool: SqlitePool,
    provider: Arc<MemoryProvider>,
    agent: Arc<ScriptedModel>,
    post: Arc<ScriptedModel>,
    function: Arc<CodeAgentFunction>,
    dispatcher: RunDispatcher,
    projects: ProjectStorage,
    messages: MessageStorage,
    runs: RunStorage,
    usage: UsageStorage,
}

async fn harness() -> Harness {
    let pool = open_in_memory().await.unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let agent = Arc::new(ScriptedModel::new());
    let post = Arc::new(ScriptedModel::new());
    post.route("title", InferenceResponse::text("Todo App"))
        .route("final agent", InferenceResponse::text("Here is your todo app."));

    let sandbox = Arc::new(SandboxManager::new(
        provider.clone(),
        Duration::from_secs(1800),
        3000,
    ));
    let steps = StepExecutor::new(
        Arc::new(StepRecordStorage::new(pool.clone())),
        RetryPolicy::new(3, Duration::from_millis(1)),
    );
    let messages = MessageStorage::new(pool.clone());
    let function = Arc::new(CodeAgentFunction::new(
        steps,
        sandbox,
        messages.clone(),
        agent.clone(),
        post.clone(),
        AgentSettings::default(),
    ));

    let projects = ProjectStorage::new(pool.clone());
    let runs = RunStorage::new(pool.clone());
    let usage = UsageStorage::new(pool.clone());
    let dispatcher = RunDispatcher::new(
        projects.clone(),
        messages.clone(),
        runs.clone(),
        usage.clone(),
        function.clone(),
    );

    Harness {
        pool,
        provider,
        agent,
        post,
        function,
        dispatcher,
        projects,
        messages,
        runs,
        usage,
    }
}

fn tool_call(id: &str, name: &str, arguments: serde_json::Value) -> InferenceResponse {
    InferenceResponse {
        output: vec![OutputMessage::ToolCall {
            id: id.to_string(),
            name: name.to_string(),
            arguments,
        }],
        usage: None,
    }
}

fn write(id: &str, path: &str, content: &str) -> InferenceResponse {
    tool_call(
        id,
        "createOrUpdateFile",
        json!({ "files": [{ "path": path, "content": content }] }),
    )
}

fn finish(summary: &str) -> InferenceResponse {
    InferenceResponse::text(format!("All done.\n<task_summary>{}</task_summary>", summary))
}

#[tokio::test]
async fn test_todo_app_run_commits_result_with_fragment() {
    let h = harness().await;
    h.agent
        .push(tool_call("t1", "terminal", json!({ "command": "npm install date-fns --yes" })))
        .push(write("t2", "app/page.tsx", "export default function Page() {}"))
        .push(finish("Built a todo app"));

    let (project, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "build a todo app")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    assert!(!outcome.is_error);
    assert_eq!(outcome.summary, "Built a todo app");
    assert_eq!(outcome.title, "Todo App");
    assert_eq!(outcome.url.as_deref(), Some("https://3000-sbx-1.sandbox.test"));

    let message = &outcome.message;
    assert_eq!(message.role, MessageRole::Assistant);
    assert_eq!(message.message_type, MessageType::Result);
    assert_eq!(message.content, "Here is your todo app.");
    let fragment = message.fragment.as_ref().unwrap();
    assert_eq!(fragment.sandbox_url, "https://3000-sbx-1.sandbox.test");
    assert_eq!(fragment.title, "Todo App");
    assert_eq!(
        fragment.files.get("app/page.tsx").map(String::as_str),
        Some("export default function Page() {}")
    );

    let all = h.messages.list_messages(&project.id).await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].role, MessageRole::User);
    assert_eq!(
        h.runs.get_run(&ticket.run.id).await.unwrap().status,
        RunStatus::Completed
    );
    assert_eq!(h.provider.created_count(), 1);
    assert_eq!(h.agent.call_count(), 3);
}

#[tokio::test]
async fn test_no_marker_within_ceiling_commits_error() {
    let h = harness().await;
    h.agent
        .push(write("t1", "index.html", "<h1>hi</h1>"))
        .fallback(InferenceResponse::text("Still working on it"));

    let (project, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "build a todo app")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    assert!(outcome.is_error);
    assert_eq!(h.agent.call_count(), 15);
    assert_eq!(h.post.call_count(), 0);
    assert_eq!(outcome.message.message_type, MessageType::Error);
    assert_eq!(outcome.message.content, ERROR_MESSAGE);
    assert!(outcome.message.fragment.is_none());
    // A text-only turn is followed by a user nudge so the next request ends on a user turn
    assert_eq!(
        h.agent.requests()[2].messages.last(),
        Some(&ChatMessage::user(CONTINUE_PROMPT))
    );

    let assistant: Vec<_> = h
        .messages
        .list_messages(&project.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(
        h.runs.get_run(&ticket.run.id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_summary_without_files_is_error() {
    let h = harness().await;
    h.agent.push(finish("Nothing to do"));

    let (_, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "say hello")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    assert!(outcome.is_error);
    assert_eq!(h.agent.call_count(), 1);
    assert_eq!(outcome.message.message_type, MessageType::Error);
}

#[tokio::test]
async fn test_second_write_to_same_path_wins() {
    let h = harness().await;
    h.agent
        .push(write("t1", "/index.html", "<h1>first</h1>"))
        .push(write("t2", "/index.html", "<h1>second</h1>"))
        .push(finish("Landing page"));

    let (_, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "landing page")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    let fragment = outcome.message.fragment.unwrap();
    assert_eq!(fragment.files["/index.html"], "<h1>second</h1>");
    assert_eq!(fragment.files.len(), 1);
}

#[tokio::test]
async fn test_failing_command_is_fed_back_and_run_continues() {
    let h = harness().await;
    h.provider.on_command(
        "npm run lint",
        ScriptedCommand::failing(1, "lint output", "Parsing error: Unexpected token"),
    );
    h.agent
        .push(tool_call("t1", "terminal", json!({ "command": "npm run lint" })))
        .push(write("t2", "app/page.tsx", "fixed"))
        .push(finish("Fixed the page"));

    let (_, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "fix lint")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    assert!(!outcome.is_error);
    let second_turn = &h.agent.requests()[1];
    let tool_result = second_turn
        .messages
        .iter()
        .find_map(|m| match m {
            ChatMessage::ToolResult { content, .. } => Some(content.clone()),
            _ => None,
        })
        .unwrap();
    assert!(tool_result.contains("Command failed"));
    assert!(tool_result.contains("Parsing error: Unexpected token"));
}

#[tokio::test]
async fn test_replaying_completed_run_reuses_everything() {
    let h = harness().await;
    h.agent
        .push(write("t1", "app/page.tsx", "v1"))
        .push(finish("Built it"));

    let project = h
        .projects
        .create_project("user-1", "build a todo app")
        .await
        .unwrap();
    let run = h.runs.create_run(&project.id, "build a todo app").await.unwrap();
    let event = RunEvent {
        value: run.prompt.clone(),
        project_id: project.id.clone(),
    };

    let first = h.function.run(&run.id, &event).await.unwrap();
    let agent_calls = h.agent.call_count();
    let post_calls = h.post.call_count();

    let second = h.function.run(&run.id, &event).await.unwrap();

    assert_eq!(first.message.id, second.message.id);
    assert_eq!(first.files, second.files);
    assert_eq!(h.provider.created_count(), 1);
    assert_eq!(h.agent.call_count(), agent_calls);
    assert_eq!(h.post.call_count(), post_calls);
    assert_eq!(h.messages.list_messages(&project.id).await.unwrap().len(), 2);
}

#[tokio::test]
async fn test_provisioning_failure_commits_error() {
    let h = harness().await;
    h.provider.fail_next_creates(3);

    let (_, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "build a todo app")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    assert!(outcome.is_error);
    assert_eq!(outcome.message.content, ERROR_MESSAGE);
    assert_eq!(h.agent.call_count(), 0);
    assert_eq!(h.provider.created_count(), 0);
}

#[tokio::test]
async fn test_follow_up_sees_recent_history() {
    let h = harness().await;
    h.agent
        .push(write("t1", "app/page.tsx", "v1"))
        .push(finish("Built a todo app"))
        .push(write("t2", "app/page.tsx", "v2"))
        .push(finish("Made it blue"));

    let (project, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "build a todo app")
        .await
        .unwrap();
    ticket.handle.await.unwrap().unwrap();

    let ticket = h
        .dispatcher
        .send_message("user-1", Plan::Free, &project.id, "make it blue")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();
    assert_eq!(outcome.files["app/page.tsx"], "v2");

    let follow_up = &h.agent.requests()[2];
    assert_eq!(
        follow_up.messages,
        vec![
            ChatMessage::user("build a todo app"),
            ChatMessage::assistant_text("Here is your todo app."),
            ChatMessage::user("make it blue"),
        ]
    );
    assert_eq!(h.provider.created_count(), 2);
}

#[tokio::test]
async fn test_follow_up_to_foreign_project_is_rejected() {
    let h = harness().await;
    let project = h
        .projects
        .create_project("user-1", "build a todo app")
        .await
        .unwrap();

    let result = h
        .dispatcher
        .send_message("user-2", Plan::Free, &project.id, "hijack")
        .await;

    assert!(matches!(result, Err(TriggerError::ProjectNotFound(_))));
}

#[tokio::test]
async fn test_exhausted_quota_prevents_run() {
    let h = harness().await;
    for _ in 0..5 {
        let outcome = h.usage.consume("user-1", Plan::Free, 1).await;
        assert!(matches!(outcome, QuotaOutcome::Ok { .. }));
    }

    let result = h
        .dispatcher
        .create_project("user-1", Plan::Free, "build a todo app")
        .await;

    assert!(matches!(result, Err(TriggerError::QuotaExceeded { .. })));
    assert!(h.projects.list_projects("user-1").await.unwrap().is_empty());
    assert_eq!(h.provider.created_count(), 0);
}

#[tokio::test]
async fn test_resume_pending_runs_queued_work() {
    let h = harness().await;
    h.agent
        .push(write("t1", "app/page.tsx", "v1"))
        .push(finish("Built it"));
    let project = h
        .projects
        .create_project("user-1", "build a todo app")
        .await
        .unwrap();
    let run = h.runs.create_run(&project.id, "build a todo app").await.unwrap();

    let tickets = h.dispatcher.resume_pending().await.unwrap();
    assert_eq!(tickets.len(), 1);
    for ticket in tickets {
        let outcome = ticket.handle.await.unwrap().unwrap();
        assert!(!outcome.is_error);
    }

    assert_eq!(h.runs.get_run(&run.id).await.unwrap().status, RunStatus::Completed);
    assert!(h.runs.list_unfinished().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_model_failing_every_attempt_mid_loop_commits_error() {
    let h = harness().await;
    h.agent
        .push(write("t1", "app/page.tsx", "v1"))
        .push_error("overloaded")
        .push_error("overloaded")
        .push_error("overloaded");

    let (project, ticket) = h
        .dispatcher
        .create_project("user-1", Plan::Free, "build a todo app")
        .await
        .unwrap();
    let outcome = ticket.handle.await.unwrap().unwrap();

    assert!(outcome.is_error);
    assert_eq!(h.agent.call_count(), 4);
    assert_eq!(h.post.call_count(), 0);
    assert_eq!(h.provider.files("sbx-1")["app/page.tsx"], "v1");

    let assistant: Vec<_> = h
        .messages
        .list_messages(&project.id)
        .await
        .unwrap()
        .into_iter()
        .filter(|m| m.role == MessageRole::Assistant)
        .collect();
    assert_eq!(assistant.len(), 1);
    assert_eq!(assistant[0].message_type, MessageType::Error);
    assert_eq!(assistant[0].content, ERROR_MESSAGE);
    assert!(assistant[0].fragment.is_none());
    assert_eq!(
        h.runs.get_run(&ticket.run.id).await.unwrap().status,
        RunStatus::Failed
    );
}

#[tokio::test]
async fn test_interrupted_run_resumes_from_partial_step_log() {
    let h = harness().await;
    h.agent
        .push(write("t1", "a.txt", "A"))
        .push(write("t2", "b.txt", "B1"))
        .push(finish("Wrote two files"));

    let project = h
        .projects
        .create_project("user-1", "write two files")
        .await
        .unwrap();
    let run = h.runs.create_run(&project.id, "write two files").await.unwrap();
    let event = RunEvent {
        value: run.prompt.clone(),
        project_id: project.id.clone(),
    };
    h.function.run(&run.id, &event).await.unwrap();

    // Keep only the steps recorded before the second agent turn, as if the process died there
    sqlx::query(
        "DELETE FROM step_records WHERE run_id = ? AND step_id NOT IN \
         ('get-sandbox-id', 'get-previous-messages', 'code-agent', 'createOrUpdateFile')",
    )
    .bind(&run.id)
    .execute(&h.pool)
    .await
    .unwrap();
    sqlx::query("DELETE FROM messages WHERE run_id = ?")
        .bind(&run.id)
        .execute(&h.pool)
        .await
        .unwrap();

    let agent_calls = h.agent.call_count();
    h.agent
        .push(write("t2", "b.txt", "B2"))
        .push(finish("Wrote two files"));

    let outcome = h.function.run(&run.id, &event).await.unwrap();

    assert!(!outcome.is_error);
    assert_eq!(h.provider.created_count(), 1);
    assert_eq!(h.agent.call_count(), agent_calls + 2);
    assert_eq!(outcome.message.message_type, MessageType::Result);
    assert_eq!(outcome.files["a.txt"], "A");
    assert_eq!(outcome.files["b.txt"], "B2");
    assert_eq!(outcome.files.len(), 2);
    assert_eq!(h.provider.files("sbx-1")["b.txt"], "B2");
    assert_eq!(h.messages.list_messages(&project.id).await.unwrap().len(), 2);
}
