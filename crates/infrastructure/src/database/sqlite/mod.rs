pub mod sqlite_cluster_store;

pub use sqlite_cluster_store::SqliteClusterStore;

use orchestrator_core::{OrchestratorError, OrchestratorResult};
use sqlx::{sqlite::SqlitePoolOptions, SqlitePool};
use std::time::Duration;
use tracing::info;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS worker_types (
        worker_name TEXT PRIMARY KEY,
        worker_class TEXT NOT NULL,
        worker_params TEXT NOT NULL,
        job_type TEXT NOT NULL,
        registered_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS nodes (
        node_url TEXT PRIMARY KEY,
        port_range_start INTEGER NOT NULL,
        port_range_end INTEGER NOT NULL,
        registered_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS worker_instances (
        worker_url TEXT PRIMARY KEY,
        node_url TEXT NOT NULL,
        port INTEGER NOT NULL,
        worker_name TEXT NOT NULL,
        worker_type TEXT NOT NULL,
        status TEXT NOT NULL,
        launched_at TEXT NOT NULL,
        last_heartbeat TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_worker_instances_node ON worker_instances (node_url, port)",
];

/// SQLite 连接池
pub struct SqliteDatabase {
    pool: SqlitePool,
}

impl SqliteDatabase {
    pub async fn connect(url: &str) -> OrchestratorResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(30))
            .connect(url)
            .await
            .map_err(OrchestratorError::Database)?;

        info!("已连接SQLite数据库: {}", url);
        Ok(Self { pool })
    }

    /// 内存数据库，单连接以保证所有查询看到同一份数据
    pub async fn in_memory() -> OrchestratorResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> OrchestratorResult<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(OrchestratorError::Database)?;
        }
        Ok(())
    }

    pub async fn health_check(&self) -> OrchestratorResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
