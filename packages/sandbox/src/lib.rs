// ABOUTME: Ephemeral sandbox management for agent runs
// ABOUTME: Re-exports the provider abstraction, the E2B backend and the lifecycle manager

pub mod manager;
pub mod providers;

pub use manager::{CommandOutcome, Result, SandboxError, SandboxHandle, SandboxManager};
pub use providers::{
    E2BProvider, ExecResult, OutputChunk, Provider as SandboxProvider, ProviderError,
    SandboxConfig, SandboxInfo, StreamType,
};

#[cfg(any(test, feature = "test-utils"))]
pub use providers::{MemoryProvider, ScriptedCommand};
