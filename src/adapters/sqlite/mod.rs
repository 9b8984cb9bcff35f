//! SQLite store adapters for the evaluation orchestrator.

pub mod connection;
pub mod evaluation_repository;
pub mod experiment_repository;
pub mod migrations;
pub mod model_repository;
pub mod study_repository;

pub use connection::{
    create_pool, create_test_pool, database_url, verify_connection, ConnectionError, PoolConfig,
};
pub use evaluation_repository::SqliteEvaluationRepository;
pub use experiment_repository::SqliteExperimentRepository;
pub use migrations::{all_embedded_migrations, Migration, MigrationError, Migrator};
pub use model_repository::SqliteModelRepository;
pub use study_repository::SqliteStudyRepository;

use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::SqlitePool;

use crate::domain::errors::{DomainError, DomainResult};
use crate::domain::ports::Store;

/// Format a timestamp for storage. Fixed width keeps text comparison in SQL
/// consistent with chronological order.
pub fn format_datetime(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse an RFC3339 datetime string from a SQLite row field.
pub fn parse_datetime(s: &str) -> DomainResult<DateTime<Utc>> {
    chrono::DateTime::parse_from_rfc3339(s)
        .map_err(|e| DomainError::SerializationError(e.to_string()))
        .map(|dt| dt.with_timezone(&Utc))
}

/// Parse an optional RFC3339 datetime string from a SQLite row field.
pub fn parse_optional_datetime(s: Option<String>) -> DomainResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_datetime(&s)).transpose()
}

/// Parse a JSON string from a SQLite row field, falling back to the type's default.
pub fn parse_json_or_default<T: serde::de::DeserializeOwned + Default>(s: Option<String>) -> DomainResult<T> {
    s.map(|s| serde_json::from_str(&s))
        .transpose()
        .map_err(|e| DomainError::SerializationError(e.to_string()))
        .map(|opt| opt.unwrap_or_default())
}

/// Convert a stored integer into an unsigned domain field.
pub(crate) fn to_u32(value: i64, field: &str) -> DomainResult<u32> {
    u32::try_from(value)
        .map_err(|_| DomainError::SerializationError(format!("{field} out of range: {value}")))
}

/// `?, ?, ?` for an `IN (...)` clause of `n` bindings.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Errors from opening and migrating the database.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    /// Opening failed.
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
    /// Migrating failed.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
    /// A query failed.
    #[error("Query error: {0}")]
    Query(#[from] sqlx::Error),
}

/// Open the pool and run pending migrations.
pub async fn initialize_database(database_url: &str, config: Option<PoolConfig>) -> Result<SqlitePool, DatabaseError> {
    let pool = create_pool(database_url, config).await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}

/// Wire every SQLite repository over one pool.
pub fn sqlite_store(pool: &SqlitePool) -> Store {
    Store::new(
        Arc::new(SqliteStudyRepository::new(pool.clone())),
        Arc::new(SqliteModelRepository::new(pool.clone())),
        Arc::new(SqliteEvaluationRepository::new(pool.clone())),
        Arc::new(SqliteExperimentRepository::new(pool.clone())),
    )
}

/// Create an in-memory test pool with all migrations applied.
pub async fn create_migrated_test_pool() -> Result<SqlitePool, DatabaseError> {
    let pool = create_test_pool().await?;
    let migrator = Migrator::new(pool.clone());
    migrator.run_embedded_migrations(all_embedded_migrations()).await?;
    Ok(pool)
}
