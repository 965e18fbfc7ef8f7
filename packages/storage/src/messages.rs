// ABOUTME: Chat message and fragment storage layer using SQLite
// ABOUTME: Recent-history lookup and atomic, run-idempotent message + fragment creation

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::{debug, info};

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "TEXT", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageType {
    Result,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: String,
    pub message_id: String,
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub project_id: String,
    pub run_id: Option<String>,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub fragment: Option<Fragment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateFragmentInput {
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateMessageInput {
    pub project_id: String,
    /// Idempotency key: at most one message is ever stored per run
    pub run_id: Option<String>,
    pub role: MessageRole,
    pub message_type: MessageType,
    pub content: String,
    pub fragment: Option<CreateFragmentInput>,
}

impl CreateMessageInput {
    pub fn user(project_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            run_id: None,
            role: MessageRole::User,
            message_type: MessageType::Result,
            content: content.into(),
            fragment: None,
        }
    }
}

const SELECT_MESSAGE: &str = r#"
    SELECT m.id, m.project_id, m.run_id, m.role, m.message_type, m.content, m.created_at,
           f.id AS fragment_id, f.sandbox_url, f.title, f.files,
           f.created_at AS fragment_created_at
    FROM messages m
    LEFT JOIN fragments f ON f.message_id = m.id
"#;

#[derive(Clone)]
pub struct MessageStorage {
    pool: SqlitePool,
}

impl MessageStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The `limit` most recent messages of a project, returned oldest-first
    pub async fn find_recent_messages(&self, project_id: &str, limit: i64) -> Result<Vec<Message>> {
        debug!(
            "Fetching {} most recent messages for project: {}",
            limit, project_id
        );

        let query = format!(
            "{} WHERE m.project_id = ? ORDER BY m.created_at DESC, m.rowid DESC LIMIT ?",
            SELECT_MESSAGE
        );
        let rows = sqlx::query(&query)
            .bind(project_id)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        let mut messages = rows
            .iter()
            .map(row_to_message)
            .collect::<Result<Vec<_>>>()?;
        messages.reverse();
        Ok(messages)
    }

    /// All messages of a project oldest-first, with their fragments
    pub async fn list_messages(&self, project_id: &str) -> Result<Vec<Message>> {
        let query = format!(
            "{} WHERE m.project_id = ? ORDER BY m.created_at ASC, m.rowid ASC",
            SELECT_MESSAGE
        );
        let rows = sqlx::query(&query)
            .bind(project_id)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(row_to_message).collect()
    }

    pub async fn get_message(&self, id: &str) -> Result<Message> {
        let query = format!("{} WHERE m.id = ?", SELECT_MESSAGE);
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_message(&row),
            None => Err(StorageError::NotFound(format!("message {}", id))),
        }
    }

    pub async fn get_message_by_run(&self, run_id: &str) -> Result<Option<Message>> {
        let query = format!("{} WHERE m.run_id = ?", SELECT_MESSAGE);
        let row = sqlx::query(&query)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(row_to_message).transpose()
    }

    /// Create a message, and its fragment if given, in one transaction.
    ///
    /// When `run_id` is set and a message for that run already exists, nothing is
    /// written and the existing message is returned.
    pub async fn create_message(&self, input: CreateMessageInput) -> Result<Message> {
        if input.fragment.is_some() && input.message_type != MessageType::Result {
            return Err(StorageError::InvalidInput(
                "fragments can only be attached to RESULT messages".to_string(),
            ));
        }

        let message_id = format!("msg-{}", nanoid::nanoid!());
        let now = Utc::now();

        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO messages (
                id, project_id, run_id, role, message_type, content, created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(run_id) DO NOTHING
            "#,
        )
        .bind(&message_id)
        .bind(&input.project_id)
        .bind(&input.run_id)
        .bind(input.role)
        .bind(input.message_type)
        .bind(&input.content)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if inserted == 0 {
            tx.rollback().await?;
            let run_id = input.run_id.unwrap_or_default();
            info!("Message for run {} already committed, reusing it", run_id);
            return self
                .get_message_by_run(&run_id)
                .await?
                .ok_or_else(|| StorageError::NotFound(format!("message for run {}", run_id)));
        }

        if let Some(fragment) = &input.fragment {
            let files_json = serde_json::to_string(&fragment.files)?;
            sqlx::query(
                r#"
                INSERT INTO fragments (
                    id, message_id, sandbox_url, title, files, created_at, updated_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(format!("frag-{}", nanoid::nanoid!()))
            .bind(&message_id)
            .bind(&fragment.sandbox_url)
            .bind(&fragment.title)
            .bind(&files_json)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;

        debug!(
            "Created {:?}/{:?} message {} for project {}",
            input.role, input.message_type, message_id, input.project_id
        );

        self.get_message(&message_id).await
    }
}

fn row_to_message(row: &SqliteRow) -> Result<Message> {
    let message_id: String = row.try_get("id")?;
    let fragment_id: Option<String> = row.try_get("fragment_id")?;

    let fragment = match fragment_id {
        Some(fragment_id) => {
            let files: String = row.try_get("files")?;
            Some(Fragment {
                id: fragment_id,
                message_id: message_id.clone(),
                sandbox_url: row.try_get("sandbox_url")?,
                title: row.try_get("title")?,
                files: serde_json::from_str(&files)?,
                created_at: row.try_get("fragment_created_at")?,
            })
        }
        None => None,
    };

    Ok(Message {
        id: message_id,
        project_id: row.try_get("project_id")?,
        run_id: row.try_get("run_id")?,
        role: row.try_get("role")?,
        message_type: row.try_get("message_type")?,
        content: row.try_get("content")?,
        created_at: row.try_get("created_at")?,
        fragment,
    })
}
