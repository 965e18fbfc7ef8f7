// ABOUTME: Environment variable name constants
// ABOUTME: Centralized definitions of all environment variable names used across Kiln

// Persistence
pub const KILN_DATABASE_URL: &str = "KILN_DATABASE_URL";

// Sandbox Provider (E2B)
pub const E2B_API_KEY: &str = "E2B_API_KEY";
pub const E2B_API_URL: &str = "E2B_API_URL";
pub const E2B_DOMAIN: &str = "E2B_DOMAIN";

// Sandbox Lifecycle
pub const KILN_SANDBOX_TEMPLATE: &str = "KILN_SANDBOX_TEMPLATE";
pub const KILN_SANDBOX_TIMEOUT_SECS: &str = "KILN_SANDBOX_TIMEOUT_SECS";
pub const KILN_PREVIEW_PORT: &str = "KILN_PREVIEW_PORT";

// Language Models
pub const ANTHROPIC_API_KEY: &str = "ANTHROPIC_API_KEY";
pub const ANTHROPIC_API_URL: &str = "ANTHROPIC_API_URL";
pub const KILN_AGENT_MODEL: &str = "KILN_AGENT_MODEL";
pub const KILN_POSTPROCESS_MODEL: &str = "KILN_POSTPROCESS_MODEL";

// Agent Network
pub const KILN_MAX_ITERATIONS: &str = "KILN_MAX_ITERATIONS";
pub const KILN_HISTORY_LIMIT: &str = "KILN_HISTORY_LIMIT";

// Step Executor Retry Policy
pub const KILN_STEP_MAX_ATTEMPTS: &str = "KILN_STEP_MAX_ATTEMPTS";
pub const KILN_STEP_BACKOFF_MS: &str = "KILN_STEP_BACKOFF_MS";

// System Environment Variables
pub const HOME: &str = "HOME";
