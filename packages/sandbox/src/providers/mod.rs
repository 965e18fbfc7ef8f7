// ABOUTME: Provider trait and implementations for sandbox execution backends
// ABOUTME: Defines abstract interface for remote sandbox lifecycle, commands and files

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

pub mod e2b;
pub mod envd;
#[cfg(any(test, feature = "test-utils"))]
pub mod memory;

pub use e2b::E2BProvider;
#[cfg(any(test, feature = "test-utils"))]
pub use memory::{MemoryProvider, ScriptedCommand};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox error: {0}")]
    SandboxError(String),

    #[error("File error: {0}")]
    FileError(String),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() || e.is_connect() {
            ProviderError::ConnectionError(e.to_string())
        } else {
            ProviderError::ApiError(e.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Sandbox configuration used at provisioning time
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub template: String,
    pub timeout: Duration,
    pub metadata: HashMap<String, String>,
}

/// Sandbox runtime information reported by a provider
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxInfo {
    pub id: String,
    pub template: String,
    pub started_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
}

/// Exit information of a finished command; output arrives as [`OutputChunk`]s
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutputChunk {
    pub timestamp: DateTime<Utc>,
    pub stream: StreamType,
    pub data: Vec<u8>,
}

impl OutputChunk {
    pub fn new(stream: StreamType, data: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream,
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StreamType {
    Stdout,
    Stderr,
}

/// Provider trait for remote sandbox backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Provision a new sandbox from a template
    async fn create_sandbox(&self, config: &SandboxConfig) -> Result<SandboxInfo>;

    /// Reconnect to a running sandbox, extending its inactivity timeout
    async fn connect(&self, sandbox_id: &str, timeout: Duration) -> Result<SandboxInfo>;

    /// Execute a shell command, streaming output chunks while it runs
    async fn exec_command(
        &self,
        sandbox_id: &str,
        command: &str,
        output: UnboundedSender<OutputChunk>,
    ) -> Result<ExecResult>;

    /// Write a file, creating parent directories as needed
    async fn write_file(&self, sandbox_id: &str, path: &str, content: &str) -> Result<()>;

    /// Read a file as UTF-8 text
    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<String>;

    /// Externally reachable host name for a port inside the sandbox
    fn host(&self, sandbox_id: &str, port: u16) -> String;
}
