use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{
    ClusterStore, NodeRegistration, OrchestratorError, OrchestratorResult, WorkerInstance,
    WorkerStatus, WorkerTypeRegistration,
};
use sqlx::{sqlite::SqliteRow, Row, SqlitePool};
use tracing::debug;

const WORKER_COLUMNS: &str =
    "worker_url, node_url, port, worker_name, worker_type, status, launched_at, last_heartbeat";

/// 基于 SQLite 的集群状态存储
pub struct SqliteClusterStore {
    pool: SqlitePool,
}

impl SqliteClusterStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_worker_type(row: &SqliteRow) -> OrchestratorResult<WorkerTypeRegistration> {
        let params: String = row.try_get("worker_params")?;
        Ok(WorkerTypeRegistration {
            worker_name: row.try_get("worker_name")?,
            worker_class: row.try_get("worker_class")?,
            worker_params: serde_json::from_str(&params).map_err(|e| {
                OrchestratorError::Serialization(format!("解析Worker参数失败: {e}"))
            })?,
            job_type: row.try_get("job_type")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    fn row_to_node(row: &SqliteRow) -> OrchestratorResult<NodeRegistration> {
        Ok(NodeRegistration {
            node_url: row.try_get("node_url")?,
            port_range_start: Self::port(row, "port_range_start")?,
            port_range_end: Self::port(row, "port_range_end")?,
            registered_at: row.try_get("registered_at")?,
        })
    }

    fn row_to_worker(row: &SqliteRow) -> OrchestratorResult<WorkerInstance> {
        let status: String = row.try_get("status")?;
        Ok(WorkerInstance {
            worker_url: row.try_get("worker_url")?,
            node_url: row.try_get("node_url")?,
            port: Self::port(row, "port")?,
            worker_name: row.try_get("worker_name")?,
            worker_type: row.try_get("worker_type")?,
            status: status.parse()?,
            launched_at: row.try_get("launched_at")?,
            last_heartbeat: row.try_get("last_heartbeat")?,
        })
    }

    fn port(row: &SqliteRow, column: &str) -> OrchestratorResult<u16> {
        let value: i64 = row.try_get(column)?;
        u16::try_from(value)
            .map_err(|_| OrchestratorError::Serialization(format!("端口值越界: {column}={value}")))
    }

    async fn fetch_workers(&self, sql: &str, bind: Option<&str>) -> OrchestratorResult<Vec<WorkerInstance>> {
        let mut query = sqlx::query(sql);
        if let Some(value) = bind {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        rows.iter().map(Self::row_to_worker).collect()
    }
}

#[async_trait]
impl ClusterStore for SqliteClusterStore {
    async fn upsert_worker_type(&self, registration: &WorkerTypeRegistration) -> OrchestratorResult<()> {
        let params = serde_json::to_string(&registration.worker_params)
            .map_err(|e| OrchestratorError::Serialization(format!("序列化Worker参数失败: {e}")))?;

        sqlx::query(
            r#"
            INSERT INTO worker_types (worker_name, worker_class, worker_params, job_type, registered_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT(worker_name) DO UPDATE SET
                worker_class = excluded.worker_class,
                worker_params = excluded.worker_params,
                job_type = excluded.job_type,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(&registration.worker_name)
        .bind(&registration.worker_class)
        .bind(params)
        .bind(&registration.job_type)
        .bind(registration.registered_at)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        debug!("注册Worker类型成功: {}", registration.worker_name);
        Ok(())
    }

    async fn get_worker_type(&self, worker_name: &str) -> OrchestratorResult<Option<WorkerTypeRegistration>> {
        let row = sqlx::query(
            "SELECT worker_name, worker_class, worker_params, job_type, registered_at FROM worker_types WHERE worker_name = $1",
        )
        .bind(worker_name)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        row.as_ref().map(Self::row_to_worker_type).transpose()
    }

    async fn list_worker_types(&self) -> OrchestratorResult<Vec<WorkerTypeRegistration>> {
        let rows = sqlx::query(
            "SELECT worker_name, worker_class, worker_params, job_type, registered_at FROM worker_types ORDER BY worker_name",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_worker_type).collect()
    }

    async fn upsert_node(&self, node: &NodeRegistration) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO nodes (node_url, port_range_start, port_range_end, registered_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(node_url) DO UPDATE SET
                port_range_start = excluded.port_range_start,
                port_range_end = excluded.port_range_end,
                registered_at = excluded.registered_at
            "#,
        )
        .bind(&node.node_url)
        .bind(i64::from(node.port_range_start))
        .bind(i64::from(node.port_range_end))
        .bind(node.registered_at)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        debug!("注册节点成功: {}", node.node_url);
        Ok(())
    }

    async fn get_node(&self, node_url: &str) -> OrchestratorResult<Option<NodeRegistration>> {
        let row = sqlx::query(
            "SELECT node_url, port_range_start, port_range_end, registered_at FROM nodes WHERE node_url = $1",
        )
        .bind(node_url)
        .fetch_optional(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeRegistration>> {
        let rows = sqlx::query(
            "SELECT node_url, port_range_start, port_range_end, registered_at FROM nodes ORDER BY node_url",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        rows.iter().map(Self::row_to_node).collect()
    }

    async fn upsert_worker(&self, worker: &WorkerInstance) -> OrchestratorResult<()> {
        sqlx::query(
            r#"
            INSERT INTO worker_instances (worker_url, node_url, port, worker_name, worker_type, status, launched_at, last_heartbeat)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT(worker_url) DO UPDATE SET
                node_url = excluded.node_url,
                port = excluded.port,
                worker_name = excluded.worker_name,
                worker_type = excluded.worker_type,
                status = excluded.status,
                launched_at = excluded.launched_at,
                last_heartbeat = excluded.last_heartbeat
            "#,
        )
        .bind(&worker.worker_url)
        .bind(&worker.node_url)
        .bind(i64::from(worker.port))
        .bind(&worker.worker_name)
        .bind(&worker.worker_type)
        .bind(worker.status.as_str())
        .bind(worker.launched_at)
        .bind(worker.last_heartbeat)
        .execute(&self.pool)
        .await
        .map_err(OrchestratorError::Database)?;

        debug!("保存Worker实例: {} ({})", worker.worker_url, worker.status);
        Ok(())
    }

    async fn get_worker(&self, worker_url: &str) -> OrchestratorResult<Option<WorkerInstance>> {
        let sql = format!("SELECT {WORKER_COLUMNS} FROM worker_instances WHERE worker_url = $1");
        let row = sqlx::query(&sql)
            .bind(worker_url)
            .fetch_optional(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;

        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerInstance>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM worker_instances ORDER BY node_url, port, launched_at"
        );
        self.fetch_workers(&sql, None).await
    }

    async fn list_node_workers(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>> {
        let sql = format!(
            "SELECT {WORKER_COLUMNS} FROM worker_instances WHERE node_url = $1 ORDER BY port, launched_at"
        );
        self.fetch_workers(&sql, Some(node_url)).await
    }

    async fn update_worker_status(&self, worker_url: &str, status: WorkerStatus) -> OrchestratorResult<bool> {
        let result = sqlx::query("UPDATE worker_instances SET status = $2 WHERE worker_url = $1")
            .bind(worker_url)
            .bind(status.as_str())
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn touch_worker(&self, worker_url: &str, at: DateTime<Utc>) -> OrchestratorResult<bool> {
        let result = sqlx::query("UPDATE worker_instances SET last_heartbeat = $2 WHERE worker_url = $1")
            .bind(worker_url)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(OrchestratorError::Database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn clear(&self) -> OrchestratorResult<()> {
        let mut tx = self.pool.begin().await.map_err(OrchestratorError::Database)?;
        for table in ["worker_instances", "nodes", "worker_types"] {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await
                .map_err(OrchestratorError::Database)?;
        }
        tx.commit().await.map_err(OrchestratorError::Database)?;
        debug!("集群状态已清空");
        Ok(())
    }
}
