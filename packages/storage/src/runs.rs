// ABOUTME: Workflow run records stored in SQLite
// ABOUTME: Tracks run status so unfinished runs can be resumed after a restart

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct RunRecord {
    pub id: String,
    pub project_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

const SELECT_RUN: &str =
    "SELECT id, project_id, prompt, status, error, created_at, updated_at, completed_at FROM runs";

#[derive(Clone)]
pub struct RunStorage {
    pool: SqlitePool,
}

impl RunStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_run(&self, project_id: &str, prompt: &str) -> Result<RunRecord> {
        let run_id = format!("run-{}", nanoid::nanoid!());
        let now = Utc::now();

        debug!("Creating run {} for project {}", run_id, project_id);

        sqlx::query(
            r#"
            INSERT INTO runs (id, project_id, prompt, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&run_id)
        .bind(project_id)
        .bind(prompt)
        .bind(RunStatus::Queued)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_run(&run_id).await
    }

    pub async fn get_run(&self, id: &str) -> Result<RunRecord> {
        sqlx::query_as::<_, RunRecord>(&format!("{} WHERE id = ?", SELECT_RUN))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("run {}", id)))
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: RunStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let now = Utc::now();
        let completed_at = status.is_finished().then_some(now);

        let updated = sqlx::query(
            "UPDATE runs SET status = ?, error = ?, updated_at = ?, completed_at = ? WHERE id = ?",
        )
        .bind(status)
        .bind(error)
        .bind(now)
        .bind(completed_at)
        .bind(id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(StorageError::NotFound(format!("run {}", id)));
        }
        Ok(())
    }

    /// Runs that were queued or running when the process stopped, oldest first
    pub async fn list_unfinished(&self) -> Result<Vec<RunRecord>> {
        let runs = sqlx::query_as::<_, RunRecord>(&format!(
            "{} WHERE status IN ('queued', 'running') ORDER BY created_at ASC",
            SELECT_RUN
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(runs)
    }
}
