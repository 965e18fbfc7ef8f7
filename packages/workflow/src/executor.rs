// ABOUTME: Durable step executor with per-run contexts
// ABOUTME: Runs each named step at most once per run, caching its output and replaying it afterwards

use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kiln_storage::{StepRecord, StorageError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::retry::RetryPolicy;
use crate::store::StepStore;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Step {step} failed after {attempts} attempts: {message}")]
    Exhausted {
        step: String,
        attempts: u32,
        message: String,
    },

    #[error("Step store error: {0}")]
    Store(#[from] StorageError),

    #[error("Step {step} output could not be serialized: {source}")]
    Serialization {
        step: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct SleepRecord {
    wake_at: DateTime<Utc>,
}

/// Shared entry point; hands out one context per run
#[derive(Clone)]
pub struct StepExecutor {
    store: Arc<dyn StepStore>,
    policy: RetryPolicy,
}

impl StepExecutor {
    pub fn new(store: Arc<dyn StepStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// Fresh context for `run_id`; occurrence counters start at zero so replays line up
    pub fn context(&self, run_id: impl Into<String>) -> StepContext {
        StepContext {
            run_id: run_id.into(),
            store: self.store.clone(),
            policy: self.policy,
            occurrences: HashMap::new(),
        }
    }
}

/// Sequential step runner for a single run
pub struct StepContext {
    run_id: String,
    store: Arc<dyn StepStore>,
    policy: RetryPolicy,
    occurrences: HashMap<String, u32>,
}

impl StepContext {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// `name` for the first occurrence, `name:N` for the N-th repeat
    fn next_step_id(&mut self, name: &str) -> String {
        let seen = self.occurrences.entry(name.to_string()).or_insert(0);
        let step_id = if *seen == 0 {
            name.to_string()
        } else {
            format!("{}:{}", name, seen)
        };
        *seen += 1;
        step_id
    }

    async fn replay<T: DeserializeOwned>(&self, step_id: &str) -> Result<Option<T>, StepError> {
        let Some(record) = self.store.load(&self.run_id, step_id).await? else {
            return Ok(None);
        };
        let value = serde_json::from_value(record.output).map_err(|source| {
            StepError::Serialization {
                step: step_id.to_string(),
                source,
            }
        })?;
        Ok(Some(value))
    }

    /// Run `body` as step `name`, or return its recorded output if it already completed
    pub async fn run<T, E, F, Fut>(&mut self, name: &str, mut body: F) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let step_id = self.next_step_id(name);

        if let Some(cached) = self.replay(&step_id).await? {
            debug!("Run {}: step {} replayed from log", self.run_id, step_id);
            return Ok(cached);
        }

        let mut attempt = 0;
        let output = loop {
            attempt += 1;
            match body().await {
                Ok(output) => break output,
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "Run {}: step {} attempt {} failed, retrying in {:?}: {}",
                        self.run_id, step_id, attempt, delay, e
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!(
                        "Run {}: step {} failed after {} attempts: {}",
                        self.run_id, step_id, attempt, e
                    );
                    return Err(StepError::Exhausted {
                        step: step_id,
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
            }
        };

        let value = serde_json::to_value(&output).map_err(|source| StepError::Serialization {
            step: step_id.clone(),
            source,
        })?;
        self.store
            .save(&StepRecord {
                run_id: self.run_id.clone(),
                step_id: step_id.clone(),
                output: value,
                attempts: attempt,
                completed_at: Utc::now(),
            })
            .await?;

        debug!(
            "Run {}: step {} completed after {} attempt(s)",
            self.run_id, step_id, attempt
        );

        // A concurrent replay may have recorded first; its output is authoritative
        match self.replay(&step_id).await? {
            Some(recorded) => Ok(recorded),
            None => Ok(output),
        }
    }

    /// Durable delay: the wake-up deadline is recorded once and honoured on replay
    pub async fn sleep(&mut self, name: &str, duration: Duration) -> Result<(), StepError> {
        let step_id = self.next_step_id(name);

        let wake_at = match self.replay::<SleepRecord>(&step_id).await? {
            Some(record) => record.wake_at,
            None => {
                let delay = chrono::Duration::from_std(duration)
                    .unwrap_or_else(|_| chrono::Duration::zero());
                let record = SleepRecord {
                    wake_at: Utc::now() + delay,
                };
                let output =
                    serde_json::to_value(&record).map_err(|source| StepError::Serialization {
                        step: step_id.clone(),
                        source,
                    })?;
                self.store
                    .save(&StepRecord {
                        run_id: self.run_id.clone(),
                        step_id: step_id.clone(),
                        output,
                        attempts: 1,
                        completed_at: Utc::now(),
                    })
                    .await?;
                record.wake_at
            }
        };

        let remaining = (wake_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !remaining.is_zero() {
            info!(
                "Run {}: step {} sleeping for {:?}",
                self.run_id, step_id, remaining
            );
            tokio::time::sleep(remaining).await;
        }
        Ok(())
    }
}
