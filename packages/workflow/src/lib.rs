// ABOUTME: Durable step execution for agent runs
// ABOUTME: Replay-safe steps, bounded retries and timer-based delays over a pluggable step log

pub mod executor;
pub mod retry;
pub mod store;

pub use executor::{StepContext, StepError, StepExecutor};
pub use retry::RetryPolicy;
pub use store::{MemoryStepStore, StepStore};
