// ABOUTME: Persistence seam for the durable step log
// ABOUTME: SQLite-backed store for production and an in-memory store for tests

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use kiln_storage::{StepRecord, StepRecordStorage, StorageError};

#[async_trait]
pub trait StepStore: Send + Sync {
    async fn load(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>, StorageError>;

    /// Persist a record; an existing record for the same key wins
    async fn save(&self, record: &StepRecord) -> Result<(), StorageError>;
}

#[async_trait]
impl StepStore for StepRecordStorage {
    async fn load(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>, StorageError> {
        self.get_record(run_id, step_id).await
    }

    async fn save(&self, record: &StepRecord) -> Result<(), StorageError> {
        self.put_record(record).await.map(|_| ())
    }
}

#[derive(Default)]
pub struct MemoryStepStore {
    records: Mutex<HashMap<(String, String), StepRecord>>,
}

impl MemoryStepStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), StepRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Step ids recorded for a run, sorted
    pub fn step_ids(&self, run_id: &str) -> Vec<String> {
        let mut ids: Vec<String> = self
            .lock()
            .keys()
            .filter(|(run, _)| run == run_id)
            .map(|(_, step)| step.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl StepStore for MemoryStepStore {
    async fn load(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>, StorageError> {
        Ok(self
            .lock()
            .get(&(run_id.to_string(), step_id.to_string()))
            .cloned())
    }

    async fn save(&self, record: &StepRecord) -> Result<(), StorageError> {
        self.lock()
            .entry((record.run_id.clone(), record.step_id.clone()))
            .or_insert_with(|| record.clone());
        Ok(())
    }
}
