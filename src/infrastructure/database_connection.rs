//! SQLite pool management and schema migration.

use std::path::Path;

use anyhow::Result;
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use tracing::info;

/// Schema generation this build writes and reads.
const SCHEMA_VERSION: i64 = 1;

const SCHEMA_SQL: &str = include_str!("../../migrations/001_schema.sql");

/// Raised when the on-disk schema is newer than this build understands.
/// Maps to process exit code 4.
#[derive(Debug, thiserror::Error)]
#[error("database schema version {found} is newer than supported version {supported}")]
pub struct SchemaMismatch {
    pub found: i64,
    pub supported: i64,
}

#[derive(Clone)]
pub struct DatabaseConnection {
    pool: SqlitePool,
}

impl DatabaseConnection {
    pub async fn new(database_url: &str) -> Result<Self> {
        let db_path = database_url
            .trim_start_matches("sqlite://")
            .trim_start_matches("sqlite:");

        if db_path != ":memory:" {
            if let Some(parent) = Path::new(db_path).parent() {
                if !parent.as_os_str().is_empty() {
                    tokio::fs::create_dir_all(parent).await?;
                }
            }
            if !Path::new(db_path).exists() {
                std::fs::File::create(db_path)?;
            }
        }

        // A `:memory:` database exists per connection; pin it to one.
        let max_connections = if db_path == ":memory:" { 1 } else { 10 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Apply the embedded schema. Idempotent; refuses to open a database
    /// written by a newer build.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        let found: i64 = sqlx::query_scalar("PRAGMA user_version")
            .fetch_one(&self.pool)
            .await?;
        if found > SCHEMA_VERSION {
            return Err(SchemaMismatch {
                found,
                supported: SCHEMA_VERSION,
            }
            .into());
        }

        // CREATE IF NOT EXISTS throughout, so re-applying is safe.
        for statement in SCHEMA_SQL.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
            .execute(&self.pool)
            .await?;

        let drugs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drugs")
            .fetch_one(&self.pool)
            .await?;
        let prices: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM price_records")
            .fetch_one(&self.pool)
            .await?;
        info!("database ready: {drugs} drugs, {prices} price rows");

        Ok(())
    }
}

/// In-memory pool with the schema applied, for tests. Pinned to a single
/// connection: every `:memory:` connection is its own database.
#[cfg(any(test, feature = "test-utils"))]
pub async fn memory_pool() -> SqlitePool {
    let conn = DatabaseConnection::new("sqlite::memory:")
        .await
        .expect("in-memory pool");
    conn.migrate().await.expect("schema");
    conn.pool().clone()
}
