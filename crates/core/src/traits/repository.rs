use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    errors::OrchestratorResult,
    models::{NodeRegistration, WorkerInstance, WorkerStatus, WorkerTypeRegistration},
};

/// 集群共享状态存储
///
/// 保存Worker类型注册、节点注册以及Worker实例/端口分配。
/// 端口占用由非Down实例推导，存储本身不做分配决策。
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// 写入或覆盖Worker类型（后写覆盖）
    async fn upsert_worker_type(&self, registration: &WorkerTypeRegistration) -> OrchestratorResult<()>;

    async fn get_worker_type(&self, worker_name: &str) -> OrchestratorResult<Option<WorkerTypeRegistration>>;

    async fn list_worker_types(&self) -> OrchestratorResult<Vec<WorkerTypeRegistration>>;

    async fn upsert_node(&self, node: &NodeRegistration) -> OrchestratorResult<()>;

    async fn get_node(&self, node_url: &str) -> OrchestratorResult<Option<NodeRegistration>>;

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeRegistration>>;

    /// 以worker_url为键写入或覆盖实例
    async fn upsert_worker(&self, worker: &WorkerInstance) -> OrchestratorResult<()>;

    async fn get_worker(&self, worker_url: &str) -> OrchestratorResult<Option<WorkerInstance>>;

    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerInstance>>;

    async fn list_node_workers(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>>;

    /// 更新实例状态，返回是否存在该实例
    async fn update_worker_status(&self, worker_url: &str, status: WorkerStatus) -> OrchestratorResult<bool>;

    /// 刷新心跳时间
    async fn touch_worker(&self, worker_url: &str, at: DateTime<Utc>) -> OrchestratorResult<bool>;

    /// 清空所有注册与分配数据
    async fn clear(&self) -> OrchestratorResult<()>;
}
