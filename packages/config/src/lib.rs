// ABOUTME: Runtime configuration for the Kiln agent runner
// ABOUTME: Reads environment variables into a validated Config with sensible defaults

pub mod constants;

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use constants::*;

pub const DEFAULT_E2B_API_URL: &str = "https://api.e2b.app";
pub const DEFAULT_E2B_DOMAIN: &str = "e2b.app";
pub const DEFAULT_ANTHROPIC_API_URL: &str = "https://api.anthropic.com/v1/messages";
pub const DEFAULT_SANDBOX_TEMPLATE: &str = "kiln-nextjs";
pub const DEFAULT_SANDBOX_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_PREVIEW_PORT: u16 = 3000;
pub const DEFAULT_AGENT_MODEL: &str = "claude-sonnet-4-20250514";
pub const DEFAULT_POSTPROCESS_MODEL: &str = "claude-3-5-haiku-20241022";
pub const DEFAULT_MAX_ITERATIONS: u32 = 15;
pub const DEFAULT_HISTORY_LIMIT: i64 = 5;
pub const DEFAULT_STEP_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_STEP_BACKOFF_MS: u64 = 500;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidNumber { name: &'static str, value: String },
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("{0} must be greater than zero")]
    ZeroValue(&'static str),
    #[error("Unable to determine home directory for the default database path")]
    NoHomeDirectory,
}

/// Sandbox backend connection settings
#[derive(Debug, Clone)]
pub struct E2bSettings {
    pub api_key: Option<String>,
    pub api_url: String,
    pub domain: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub e2b: E2bSettings,
    pub sandbox_template: String,
    pub sandbox_timeout: Duration,
    pub preview_port: u16,
    pub anthropic_api_key: Option<String>,
    pub anthropic_api_url: String,
    pub agent_model: String,
    pub postprocess_model: String,
    pub max_iterations: u32,
    pub history_limit: i64,
    pub step_max_attempts: u32,
    pub step_backoff: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build a config from an arbitrary variable source (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let database_url = match non_empty(&lookup, KILN_DATABASE_URL) {
            Some(url) => url,
            None => default_database_url(&lookup)?,
        };

        let preview_port: u16 = parse_or(&lookup, KILN_PREVIEW_PORT, DEFAULT_PREVIEW_PORT)?;
        if preview_port == 0 {
            return Err(ConfigError::PortOutOfRange(preview_port));
        }

        let timeout_secs: u64 = parse_or(
            &lookup,
            KILN_SANDBOX_TIMEOUT_SECS,
            DEFAULT_SANDBOX_TIMEOUT_SECS,
        )?;
        if timeout_secs == 0 {
            return Err(ConfigError::ZeroValue(KILN_SANDBOX_TIMEOUT_SECS));
        }

        let max_iterations: u32 = parse_or(&lookup, KILN_MAX_ITERATIONS, DEFAULT_MAX_ITERATIONS)?;
        if max_iterations == 0 {
            return Err(ConfigError::ZeroValue(KILN_MAX_ITERATIONS));
        }

        let step_max_attempts: u32 =
            parse_or(&lookup, KILN_STEP_MAX_ATTEMPTS, DEFAULT_STEP_MAX_ATTEMPTS)?;
        if step_max_attempts == 0 {
            return Err(ConfigError::ZeroValue(KILN_STEP_MAX_ATTEMPTS));
        }

        let config = Config {
            database_url,
            e2b: E2bSettings {
                api_key: non_empty(&lookup, E2B_API_KEY),
                api_url: non_empty(&lookup, E2B_API_URL)
                    .unwrap_or_else(|| DEFAULT_E2B_API_URL.to_string()),
                domain: non_empty(&lookup, E2B_DOMAIN)
                    .unwrap_or_else(|| DEFAULT_E2B_DOMAIN.to_string()),
            },
            sandbox_template: non_empty(&lookup, KILN_SANDBOX_TEMPLATE)
                .unwrap_or_else(|| DEFAULT_SANDBOX_TEMPLATE.to_string()),
            sandbox_timeout: Duration::from_secs(timeout_secs),
            preview_port,
            anthropic_api_key: non_empty(&lookup, ANTHROPIC_API_KEY),
            anthropic_api_url: non_empty(&lookup, ANTHROPIC_API_URL)
                .unwrap_or_else(|| DEFAULT_ANTHROPIC_API_URL.to_string()),
            agent_model: non_empty(&lookup, KILN_AGENT_MODEL)
                .unwrap_or_else(|| DEFAULT_AGENT_MODEL.to_string()),
            postprocess_model: non_empty(&lookup, KILN_POSTPROCESS_MODEL)
                .unwrap_or_else(|| DEFAULT_POSTPROCESS_MODEL.to_string()),
            max_iterations,
            history_limit: parse_or(&lookup, KILN_HISTORY_LIMIT, DEFAULT_HISTORY_LIMIT)?,
            step_max_attempts,
            step_backoff: Duration::from_millis(parse_or(
                &lookup,
                KILN_STEP_BACKOFF_MS,
                DEFAULT_STEP_BACKOFF_MS,
            )?),
        };

        debug!(
            "Loaded config: database={}, template={}, agent_model={}, max_iterations={}",
            config.database_url, config.sandbox_template, config.agent_model, config.max_iterations
        );

        Ok(config)
    }
}

/// Get the path to the Kiln directory (~/.kiln)
pub fn kiln_dir() -> Option<PathBuf> {
    std::env::var(HOME)
        .ok()
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .map(|home| home.join(".kiln"))
}

fn default_database_url<F>(lookup: &F) -> Result<String, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let dir = lookup(HOME)
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .map(|home| home.join(".kiln"))
        .ok_or(ConfigError::NoHomeDirectory)?;
    Ok(format!("sqlite://{}?mode=rwc", dir.join("kiln.db").display()))
}

fn non_empty<F>(lookup: &F, name: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn parse_or<F, T>(lookup: &F, name: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    match non_empty(lookup, name) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { name, value: raw }),
        None => Ok(default),
    }
}
