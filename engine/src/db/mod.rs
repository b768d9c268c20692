/// Worker registry persistence
///
/// SQLite database (WAL mode) recording every container a session creates,
/// so a restarted service can find and clean up workers orphaned by a crash.
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

pub mod workers;

pub use workers::{WorkerRecord, WorkerRepository};

/// Database connection pool
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Open (or create) the registry at `db_path`
    ///
    /// Creates the parent directory, enables WAL and runs migrations.
    /// SQLite replays a leftover WAL on open, so an unclean shutdown needs
    /// no extra recovery step here.
    pub async fn new(db_path: &Path) -> Result<Self> {
        info!("Initializing registry at: {}", db_path.display());

        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create registry directory")?;
        }

        let connection_string = format!("sqlite:{}", db_path.display());
        let options = SqliteConnectOptions::from_str(&connection_string)?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .disable_statement_logging();

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .context("Failed to connect to registry")?;

        debug!("Registry connection established");

        let db = Self { pool };
        db.run_migrations().await?;

        Ok(db)
    }

    /// Migrations are idempotent and run on every open
    async fn run_migrations(&self) -> Result<()> {
        sqlx::raw_sql(include_str!("../../migrations/001_initial.sql"))
            .execute(&self.pool)
            .await
            .context("Failed to execute migration 001_initial.sql")?;

        debug!("Registry migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Checkpoint the WAL into the main database file
    pub async fn flush_wal(&self) -> Result<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await
            .context("Failed to flush WAL")?;

        debug!("WAL flushed successfully");
        Ok(())
    }

    /// Flush the WAL and close every connection
    pub async fn close(self) -> Result<()> {
        self.flush_wal().await?;
        self.pool.close().await;

        info!("Registry closed");
        Ok(())
    }

    /// Create a worker repository
    pub fn workers(&self) -> WorkerRepository {
        WorkerRepository::new(self.pool.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("registry.db");

        let db = Database::new(&db_path).await.unwrap();

        assert!(db_path.exists());

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
                .fetch_all(db.pool())
                .await
                .unwrap();
        assert!(tables.contains(&"workers".to_string()));

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_wal_mode_enabled() {
        let temp_dir = TempDir::new().unwrap();
        let db = Database::new(&temp_dir.path().join("registry.db"))
            .await
            .unwrap();

        let journal_mode: String = sqlx::query_scalar("PRAGMA journal_mode")
            .fetch_one(db.pool())
            .await
            .unwrap();

        assert_eq!(journal_mode.to_lowercase(), "wal");

        db.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("registry.db");

        let db = Database::new(&db_path).await.unwrap();
        db.workers()
            .record(&WorkerRecord::new("c0", "s1", "simple", 0, 8000, "m1.gguf"))
            .await
            .unwrap();
        db.close().await.unwrap();

        let db = Database::new(&db_path).await.unwrap();
        assert_eq!(db.workers().list_all().await.unwrap().len(), 1);
        db.close().await.unwrap();
    }
}
