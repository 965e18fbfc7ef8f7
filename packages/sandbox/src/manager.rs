// ABOUTME: Sandbox lifecycle manager on top of a provider backend
// ABOUTME: Creates and reconnects sandboxes, runs commands with output capture, resolves preview URLs

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::providers::{OutputChunk, Provider, ProviderError, SandboxConfig, SandboxInfo, StreamType};

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

/// Serializable reference to a running sandbox, safe to cache in a step record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub id: String,
    pub template: String,
    /// Externally reachable host of the preview port
    pub host: String,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommandOutcome {
    Succeeded {
        stdout: String,
        stderr: String,
    },
    Failed {
        error: String,
        stdout: String,
        stderr: String,
    },
}

impl CommandOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    /// Text handed back to the model: stdout, or a diagnostic that keeps both streams
    pub fn into_tool_output(self) -> String {
        match self {
            Self::Succeeded { stdout, .. } => stdout,
            Self::Failed {
                error,
                stdout,
                stderr,
            } => format!(
                "Command failed: {}\n\nStderr: {}\n\nStdout: {}",
                error, stderr, stdout
            ),
        }
    }
}

pub struct SandboxManager {
    provider: Arc<dyn Provider>,
    timeout: Duration,
    preview_port: u16,
}

impl SandboxManager {
    pub fn new(provider: Arc<dyn Provider>, timeout: Duration, preview_port: u16) -> Self {
        Self {
            provider,
            timeout,
            preview_port,
        }
    }

    fn handle(&self, info: SandboxInfo) -> SandboxHandle {
        SandboxHandle {
            host: self.provider.host(&info.id, self.preview_port),
            id: info.id,
            template: info.template,
            expires_at: info.end_at,
        }
    }

    /// Provision a sandbox from `template` with the configured inactivity timeout
    pub async fn create(&self, template: &str) -> Result<SandboxHandle> {
        let mut metadata = HashMap::new();
        metadata.insert("app".to_string(), "kiln".to_string());

        let config = SandboxConfig {
            template: template.to_string(),
            timeout: self.timeout,
            metadata,
        };

        let info = self.provider.create_sandbox(&config).await?;
        info!("Sandbox {} ready (template {})", info.id, template);
        Ok(self.handle(info))
    }

    /// Reconnect to an existing sandbox and push its timeout forward
    pub async fn lookup(&self, sandbox_id: &str) -> Result<SandboxHandle> {
        let info = self.provider.connect(sandbox_id, self.timeout).await?;
        debug!("Reconnected to sandbox {}", sandbox_id);
        Ok(self.handle(info))
    }

    /// Run a shell command; transport errors and non-zero exits come back as `Failed`
    pub async fn run_command(&self, sandbox_id: &str, command: &str) -> CommandOutcome {
        let (tx, mut rx) = mpsc::unbounded_channel::<OutputChunk>();

        debug!("Sandbox {}: running `{}`", sandbox_id, command);
        let result = self.provider.exec_command(sandbox_id, command, tx).await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Ok(chunk) = rx.try_recv() {
            match chunk.stream {
                StreamType::Stdout => stdout.extend_from_slice(&chunk.data),
                StreamType::Stderr => stderr.extend_from_slice(&chunk.data),
            }
        }
        let stdout = String::from_utf8_lossy(&stdout).into_owned();
        let stderr = String::from_utf8_lossy(&stderr).into_owned();

        let error = match result {
            Ok(exec) if exec.exit_code == 0 && exec.error.is_none() => {
                return CommandOutcome::Succeeded { stdout, stderr };
            }
            Ok(exec) => exec
                .error
                .unwrap_or_else(|| format!("exit status {}", exec.exit_code)),
            Err(e) => e.to_string(),
        };

        warn!("Sandbox {}: command failed: {}", sandbox_id, error);
        CommandOutcome::Failed {
            error,
            stdout,
            stderr,
        }
    }

    pub async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()> {
        self.provider.write_file(sandbox_id, path, content).await?;
        debug!("Sandbox {}: wrote {} ({} bytes)", sandbox_id, path, content.len());
        Ok(())
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String> {
        Ok(self.provider.read_file(sandbox_id, path).await?)
    }

    /// Public URL of the preview port
    pub fn preview_url(&self, sandbox_id: &str) -> String {
        self.url_for_port(sandbox_id, self.preview_port)
    }

    pub fn url_for_port(&self, sandbox_id: &str, port: u16) -> String {
        format!("https://{}", self.provider.host(sandbox_id, port))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MemoryProvider, ScriptedCommand};
    use pretty_assertions::assert_eq;

    fn manager() -> (Arc<MemoryProvider>, SandboxManager) {
        let provider = Arc::new(MemoryProvider::new());
        let manager = SandboxManager::new(provider.clone(), Duration::from_secs(1800), 3000);
        (provider, manager)
    }

    #[tokio::test]
    async fn test_create_and_lookup_share_sandbox() {
        let (provider, manager) = manager();

        let created = manager.create("kiln-nextjs").await.unwrap();
        let found = manager.lookup(&created.id).await.unwrap();

        assert_eq!(created.id, found.id);
        assert_eq!(found.host, format!("3000-{}.sandbox.test", created.id));
        assert_eq!(provider.created_count(), 1);
    }

    #[tokio::test]
    async fn test_lookup_unknown_sandbox_fails() {
        let (_provider, manager) = manager();

        let result = manager.lookup("missing").await;
        assert!(matches!(
            result,
            Err(SandboxError::Provider(ProviderError::NotFound(_)))
        ));
    }

    #[tokio::test]
    async fn test_successful_command_returns_stdout() {
        let (provider, manager) = manager();
        provider.on_command("ls", ScriptedCommand::ok("package.json\n"));
        let sandbox = manager.create("kiln-nextjs").await.unwrap();

        let outcome = manager.run_command(&sandbox.id, "ls").await;
        assert!(outcome.is_success());
        assert_eq!(outcome.into_tool_output(), "package.json\n");
    }

    #[tokio::test]
    async fn test_non_zero_exit_is_formatted_failure() {
        let (provider, manager) = manager();
        provider.on_command(
            "npm install",
            ScriptedCommand::failing(1, "partial", "ERR! missing peer"),
        );
        let sandbox = manager.create("kiln-nextjs").await.unwrap();

        let outcome = manager.run_command(&sandbox.id, "npm install foo").await;
        assert!(!outcome.is_success());
        assert_eq!(
            outcome.into_tool_output(),
            "Command failed: exit status 1\n\nStderr: ERR! missing peer\n\nStdout: partial"
        );
    }

    #[tokio::test]
    async fn test_transport_error_is_failure_not_panic() {
        let (_provider, manager) = manager();

        let outcome = manager.run_command("gone", "ls").await;
        let text = outcome.into_tool_output();
        assert!(text.starts_with("Command failed: Sandbox not found: gone"));
    }

    #[tokio::test]
    async fn test_files_and_preview_url() {
        let (_provider, manager) = manager();
        let sandbox = manager.create("kiln-nextjs").await.unwrap();

        manager
            .write_file(&sandbox.id, "app/page.tsx", "export default 1")
            .await
            .unwrap();
        let content = manager.read_file(&sandbox.id, "app/page.tsx").await.unwrap();

        assert_eq!(content, "export default 1");
        assert_eq!(
            manager.preview_url(&sandbox.id),
            format!("https://3000-{}.sandbox.test", sandbox.id)
        );
    }
}
