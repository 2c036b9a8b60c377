use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::AppError;

pub struct DatabaseManager {
    pub pool: Pool<Sqlite>,
}

impl DatabaseManager {
    pub async fn new(db_path: &Path) -> Result<Self, AppError> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }

        log::info!("Connecting to database at: {:?}", db_path);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                SqliteConnectOptions::new()
                    .filename(db_path)
                    .create_if_missing(true)
                    .journal_mode(SqliteJournalMode::Wal)
                    // Writers from other users' mutations wait instead of failing.
                    .busy_timeout(Duration::from_secs(5)),
            )
            .await
            .map_err(|e| AppError::Database(format!("Failed to connect to database: {}", e)))?;

        Self::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Private in-memory database. A single connection that never idles out,
    /// since every new connection would otherwise see an empty database.
    pub async fn in_memory() -> Result<Self, AppError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(SqliteConnectOptions::from_str("sqlite::memory:")?)
            .await?;

        Self::apply_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn apply_schema(pool: &Pool<Sqlite>) -> Result<(), AppError> {
        let schema = include_str!("schema.sql");

        for statement in schema.split(';') {
            let stmt = statement.trim();
            if !stmt.is_empty() {
                sqlx::query(stmt).execute(pool).await.map_err(|e| {
                    AppError::Database(format!(
                        "Failed to execute schema statement '{}': {}",
                        stmt, e
                    ))
                })?;
            }
        }

        Ok(())
    }
}
