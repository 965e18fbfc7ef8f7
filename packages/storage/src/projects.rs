// ABOUTME: Project storage layer using SQLite
// ABOUTME: Creates projects with a generated slug name together with their opening user message

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;

use crate::messages::{MessageRole, MessageType};
use crate::{Result, StorageError};

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "clever", "crisp", "dusty", "eager", "fancy", "gentle", "golden",
    "happy", "hidden", "jolly", "lively", "lucky", "mellow", "misty", "nimble", "proud", "quiet",
    "rapid", "rustic", "shiny", "silent", "sunny", "swift", "tidy", "vivid", "witty", "young",
];

const NOUNS: &[&str] = &[
    "anchor", "badger", "beacon", "canyon", "comet", "dolphin", "ember", "falcon", "forest",
    "garden", "harbor", "island", "lantern", "meadow", "nebula", "orchid", "otter", "pebble",
    "planet", "river", "rocket", "sparrow", "summit", "thunder", "tiger", "valley", "willow",
    "window", "wizard", "zephyr",
];

/// Random two-word kebab-case name such as `swift-otter`
pub fn generate_slug() -> String {
    let mut rng = rand::thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("new");
    let noun = NOUNS.choose(&mut rng).copied().unwrap_or("project");
    format!("{}-{}", adjective, noun)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ProjectStorage {
    pool: SqlitePool,
}

impl ProjectStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a project and its first USER message in one transaction
    pub async fn create_project(&self, user_id: &str, prompt: &str) -> Result<Project> {
        let project_id = format!("proj-{}", nanoid::nanoid!());
        let name = generate_slug();
        let now = Utc::now();

        debug!("Creating project {} ({}) for user {}", project_id, name, user_id);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO projects (id, name, user_id, created_at, updated_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&project_id)
        .bind(&name)
        .bind(user_id)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO messages (
                id, project_id, run_id, role, message_type, content, created_at, updated_at
            ) VALUES (?, ?, NULL, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format!("msg-{}", nanoid::nanoid!()))
        .bind(&project_id)
        .bind(MessageRole::User)
        .bind(MessageType::Result)
        .bind(prompt)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Project {
            id: project_id,
            name,
            user_id: user_id.to_string(),
            created_at: now,
        })
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        sqlx::query_as::<_, Project>(
            "SELECT id, name, user_id, created_at FROM projects WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| StorageError::NotFound(format!("project {}", id)))
    }

    /// Up to 100 projects of a user, oldest first
    pub async fn list_projects(&self, user_id: &str) -> Result<Vec<Project>> {
        let projects = sqlx::query_as::<_, Project>(
            "SELECT id, name, user_id, created_at FROM projects WHERE user_id = ? ORDER BY created_at ASC LIMIT 100",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(projects)
    }
}
