//! Knowledge Store: transactional persistence for tasks and everything a
//! task owns.
//!
//! Runs on SQLite through sqlx. Writers never partially apply a multi-row
//! transition; readers see only committed state. The store is the single
//! mutator of persistent entities.

mod entities;
mod operations;
mod schema;
mod sources;
mod synthesis;
mod tasks;

pub use entities::Artifact;
pub use operations::{EvidenceAggregate, OperationTransition};
pub use synthesis::DokStats;
pub use tasks::TaskCounts;

use std::path::Path;
use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("invalid stored data: {0}")]
    InvalidData(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Clone)]
pub struct Store {
    pool: Pool<Sqlite>,
}

impl Store {
    /// Open (or create) an on-disk store.
    pub async fn open(db_path: impl AsRef<Path>) -> StoreResult<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path.as_ref())
            .create_if_missing(true)
            .busy_timeout(std::time::Duration::from_secs(5))
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        schema::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests and the CLI demo mode. Single connection so
    /// the database outlives individual acquisitions.
    pub async fn in_memory() -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(StoreError::Database)?
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        schema::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    pub(crate) fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

/// Parse an rfc3339 timestamp persisted by this store.
pub(crate) fn parse_ts(value: &str) -> StoreResult<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&chrono::Utc))
        .map_err(|e| StoreError::InvalidData(format!("bad timestamp '{value}': {e}")))
}

pub(crate) fn parse_opt_ts(
    value: &Option<String>,
) -> StoreResult<Option<chrono::DateTime<chrono::Utc>>> {
    value.as_deref().map(parse_ts).transpose()
}
