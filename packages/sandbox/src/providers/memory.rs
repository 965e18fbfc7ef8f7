// ABOUTME: In-memory sandbox provider for tests
// ABOUTME: Keeps files in maps and answers commands from scripted responses

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc::UnboundedSender;

use super::{
    ExecResult, OutputChunk, Provider, ProviderError, Result, SandboxConfig, SandboxInfo,
    StreamType,
};

/// Canned response for commands containing a substring
#[derive(Debug, Clone, Default)]
pub struct ScriptedCommand {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub error: Option<String>,
}

impl ScriptedCommand {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Default::default()
        }
    }

    pub fn failing(exit_code: i64, stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            exit_code,
            error: None,
        }
    }
}

#[derive(Default)]
struct MemoryState {
    sandboxes: HashMap<String, SandboxInfo>,
    files: HashMap<String, BTreeMap<String, String>>,
    commands: Vec<(String, String)>,
    scripts: Vec<(String, ScriptedCommand)>,
    failing_writes: HashSet<String>,
    failing_creates: usize,
}

#[derive(Default)]
pub struct MemoryProvider {
    state: Mutex<MemoryState>,
    next_id: AtomicUsize,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn created_count(&self) -> usize {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Every command executed so far as (sandbox id, command)
    pub fn executed_commands(&self) -> Vec<(String, String)> {
        self.lock().commands.clone()
    }

    pub fn files(&self, sandbox_id: &str) -> BTreeMap<String, String> {
        self.lock().files.get(sandbox_id).cloned().unwrap_or_default()
    }

    pub fn on_command(&self, contains: impl Into<String>, response: ScriptedCommand) {
        self.lock().scripts.push((contains.into(), response));
    }

    pub fn fail_next_creates(&self, count: usize) {
        self.lock().failing_creates = count;
    }

    pub fn fail_writes_to(&self, path: impl Into<String>) {
        self.lock().failing_writes.insert(path.into());
    }

    fn ensure_exists(state: &MemoryState, sandbox_id: &str) -> Result<()> {
        if state.sandboxes.contains_key(sandbox_id) {
            Ok(())
        } else {
            Err(ProviderError::NotFound(sandbox_id.to_string()))
        }
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    async fn create_sandbox(&self, config: &SandboxConfig) -> Result<SandboxInfo> {
        let mut state = self.lock();
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(ProviderError::ApiError("template unavailable".to_string()));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let now = Utc::now();
        let info = SandboxInfo {
            id: format!("sbx-{}", n),
            template: config.template.clone(),
            started_at: Some(now),
            end_at: chrono::Duration::from_std(config.timeout)
                .ok()
                .map(|timeout| now + timeout),
        };
        state.sandboxes.insert(info.id.clone(), info.clone());
        state.files.insert(info.id.clone(), BTreeMap::new());
        Ok(info)
    }

    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> Result<SandboxInfo> {
        let mut state = self.lock();
        let info = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| ProviderError::NotFound(sandbox_id.to_string()))?;
        info.end_at = chrono::Duration::from_std(timeout)
            .ok()
            .map(|timeout| Utc::now() + timeout);
        Ok(info.clone())
    }

    async fn exec_command(
        &self,
        sandbox_id: &str,
        command: &str,
        output: UnboundedSender<OutputChunk>,
    ) -> Result<ExecResult> {
        let response = {
            let mut state = self.lock();
            Self::ensure_exists(&state, sandbox_id)?;
            state
                .commands
                .push((sandbox_id.to_string(), command.to_string()));
            state
                .scripts
                .iter()
                .find(|(contains, _)| command.contains(contains.as_str()))
                .map(|(_, response)| response.clone())
                .unwrap_or_default()
        };

        if !response.stdout.is_empty() {
            let _ = output.send(OutputChunk::new(StreamType::Stdout, response.stdout));
        }
        if !response.stderr.is_empty() {
            let _ = output.send(OutputChunk::new(StreamType::Stderr, response.stderr));
        }

        Ok(ExecResult {
            exit_code: response.exit_code,
            error: response.error,
        })
    }

    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        let mut state = self.lock();
        Self::ensure_exists(&state, sandbox_id)?;
        if state.failing_writes.contains(path) {
            return Err(ProviderError::FileError(format!("permission denied: {}", path)));
        }
        state
            .files
            .entry(sandbox_id.to_string())
            .or_default()
            .insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        let state = self.lock();
        Self::ensure_exists(&state, sandbox_id)?;
        state
            .files
            .get(sandbox_id)
            .and_then(|files| files.get(path))
            .cloned()
            .ok_or_else(|| ProviderError::FileError(format!("file not found: {}", path)))
    }

    fn host(&self, sandbox_id: &str, port: u16) -> String {
        format!("{}-{}.sandbox.test", port, sandbox_id)
    }
}
