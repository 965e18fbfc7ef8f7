// ABOUTME: Durable step log stored in SQLite
// ABOUTME: Caches serialized step outputs keyed by (run_id, step_id); the first write wins

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use crate::Result;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub run_id: String,
    pub step_id: String,
    pub output: JsonValue,
    pub attempts: u32,
    pub completed_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct StepRecordStorage {
    pool: SqlitePool,
}

impl StepRecordStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get_record(&self, run_id: &str, step_id: &str) -> Result<Option<StepRecord>> {
        let row = sqlx::query(
            r#"
            SELECT run_id, step_id, output, attempts, completed_at
            FROM step_records
            WHERE run_id = ? AND step_id = ?
            "#,
        )
        .bind(run_id)
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    /// Insert a record; an existing record for the same key is left untouched
    pub async fn put_record(&self, record: &StepRecord) -> Result<bool> {
        let output = serde_json::to_string(&record.output)?;

        let inserted = sqlx::query(
            r#"
            INSERT OR IGNORE INTO step_records (run_id, step_id, output, attempts, completed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.run_id)
        .bind(&record.step_id)
        .bind(&output)
        .bind(record.attempts as i64)
        .bind(record.completed_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 0 {
            debug!(
                "Step {} of run {} was already recorded",
                record.step_id, record.run_id
            );
        }
        Ok(inserted > 0)
    }

    pub async fn list_records(&self, run_id: &str) -> Result<Vec<StepRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT run_id, step_id, output, attempts, completed_at
            FROM step_records
            WHERE run_id = ?
            ORDER BY completed_at ASC, rowid ASC
            "#,
        )
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }
}

fn row_to_record(row: &SqliteRow) -> Result<StepRecord> {
    let output: String = row.try_get("output")?;
    let attempts: i64 = row.try_get("attempts")?;

    Ok(StepRecord {
        run_id: row.try_get("run_id")?,
        step_id: row.try_get("step_id")?,
        output: serde_json::from_str(&output)?,
        attempts: attempts.max(0) as u32,
        completed_at: row.try_get("completed_at")?,
    })
}
