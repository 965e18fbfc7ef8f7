// ABOUTME: Data layer and persistence for Kiln
// ABOUTME: SQLite pool setup, embedded migrations and the storage types for every table

pub mod messages;
pub mod projects;
pub mod runs;
pub mod steps;
pub mod usage;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::info;

pub use messages::{
    CreateFragmentInput, CreateMessageInput, Fragment, Message, MessageRole, MessageStorage,
    MessageType,
};
pub use projects::{generate_slug, Project, ProjectStorage};
pub use runs::{RunRecord, RunStatus, RunStorage};
pub use steps::{StepRecord, StepRecordStorage};
pub use usage::{Plan, QuotaOutcome, UsageStatus, UsageStorage, GENERATION_COST};

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open a SQLite pool at `database_url` and run the embedded migrations
pub async fn open_pool(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    info!("Opened database at {}", database_url);
    Ok(pool)
}

/// Open an isolated in-memory database (single connection so every query sees the same data)
pub async fn open_in_memory() -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await?;

    migrate(&pool).await?;
    Ok(pool)
}

pub async fn migrate(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}
