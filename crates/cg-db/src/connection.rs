use std::path::Path;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

use cg_types::{CallGuardError, Result};

/// Async SQLite store backing the audit log and incident tracker.
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) a database file.
    pub async fn new(path: &Path) -> Result<Self> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_millis(5000));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(opts)
            .await
            .map_err(|e| CallGuardError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Create a new in-memory database (for testing).
    pub async fn in_memory() -> Result<Self> {
        let opts = SqliteConnectOptions::new().filename(":memory:");

        // One connection: every in-memory connection is its own database
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(opts)
            .await
            .map_err(|e| CallGuardError::Database(format!("Failed to connect: {e}")))?;

        Ok(Self { pool })
    }

    /// Initialize all database tables and indexes.
    pub async fn initialize(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS audit_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                component TEXT NOT NULL,
                event TEXT NOT NULL,
                detail TEXT NOT NULL DEFAULT 'null'
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CallGuardError::Database(format!("Create audit_log table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_audit_log_component_time
             ON audit_log(component, timestamp)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CallGuardError::Database(format!("Create audit_log index: {e}")))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS incidents (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                severity TEXT NOT NULL,
                title TEXT NOT NULL,
                error_message TEXT NOT NULL,
                metadata TEXT NOT NULL DEFAULT 'null',
                status TEXT NOT NULL DEFAULT 'open',
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CallGuardError::Database(format!("Create incidents table: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_incidents_status
             ON incidents(status, created_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| CallGuardError::Database(format!("Create incidents index: {e}")))?;

        info!("Database schema initialized (2 tables, 2 indexes)");
        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Close the database.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database connection closed");
    }
}
