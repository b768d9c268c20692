/// Worker registry rows
///
/// One row per live container. Sessions insert right after a create call
/// succeeds and delete once the container is removed.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

/// A registered worker container
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub container_id: String,
    pub session_id: String,
    pub pipeline: String,
    pub worker_index: i64,
    pub port: i64,
    pub model: String,
    pub created_at: i64,
}

impl WorkerRecord {
    pub fn new(
        container_id: impl Into<String>,
        session_id: impl Into<String>,
        pipeline: impl Into<String>,
        worker_index: usize,
        port: u16,
        model: impl Into<String>,
    ) -> Self {
        Self {
            container_id: container_id.into(),
            session_id: session_id.into(),
            pipeline: pipeline.into(),
            worker_index: i64::try_from(worker_index).unwrap_or(i64::MAX),
            port: i64::from(port),
            model: model.into(),
            created_at: chrono::Utc::now().timestamp(),
        }
    }
}

/// Repository for the `workers` table
#[derive(Clone)]
pub struct WorkerRepository {
    pool: SqlitePool,
}

impl WorkerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert a worker; re-recording the same container replaces the row
    pub async fn record(&self, record: &WorkerRecord) -> Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO workers \
             (container_id, session_id, pipeline, worker_index, port, model, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.container_id)
        .bind(&record.session_id)
        .bind(&record.pipeline)
        .bind(record.worker_index)
        .bind(record.port)
        .bind(&record.model)
        .bind(record.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to record worker")?;

        Ok(())
    }

    /// Delete a worker row; returns whether a row existed
    pub async fn delete(&self, container_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM workers WHERE container_id = ?")
            .bind(container_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete worker")?;

        Ok(result.rows_affected() > 0)
    }

    /// Every registered worker, oldest first
    pub async fn list_all(&self) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            "SELECT container_id, session_id, pipeline, worker_index, port, model, created_at \
             FROM workers ORDER BY created_at, session_id, worker_index",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list workers")?;

        Ok(rows.iter().map(Self::from_row).collect())
    }

    /// Workers of one session in index order
    pub async fn list_session(&self, session_id: &str) -> Result<Vec<WorkerRecord>> {
        let rows = sqlx::query(
            "SELECT container_id, session_id, pipeline, worker_index, port, model, created_at \
             FROM workers WHERE session_id = ? ORDER BY worker_index",
        )
        .bind(session_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list session workers")?;

        Ok(rows.iter().map(Self::from_row).collect())
    }

    fn from_row(r: &sqlx::sqlite::SqliteRow) -> WorkerRecord {
        WorkerRecord {
            container_id: r.get("container_id"),
            session_id: r.get("session_id"),
            pipeline: r.get("pipeline"),
            worker_index: r.get("worker_index"),
            port: r.get("port"),
            model: r.get("model"),
            created_at: r.get("created_at"),
        }
    }
}
