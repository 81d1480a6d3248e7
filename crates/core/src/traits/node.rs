use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    errors::OrchestratorResult,
    models::{LaunchRequest, WorkerReport},
};

/// 节点代理接口，仅供集群管理器调用
#[async_trait]
pub trait NodeAgentApi: Send + Sync {
    /// 在指定地址上启动Worker，完成健康检查后返回
    async fn launch_worker(&self, request: LaunchRequest) -> OrchestratorResult<WorkerReport>;

    /// 终止指定Worker，确认退出后返回
    async fn shutdown_worker(&self, worker_name: &str) -> OrchestratorResult<WorkerReport>;

    /// 终止本节点全部Worker，确认退出后返回
    async fn shutdown_all_workers(&self) -> OrchestratorResult<Vec<WorkerReport>>;

    /// 当前存活的Worker
    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerReport>>;
}

/// 由节点地址得到节点代理句柄
pub trait NodeConnector: Send + Sync {
    fn connect(&self, node_url: &str) -> OrchestratorResult<Arc<dyn NodeAgentApi>>;
}

/// 节点代理向集群管理器的上报通道
#[async_trait]
pub trait ClusterReporter: Send + Sync {
    /// 心跳：上报存活Worker名称
    async fn worker_heartbeat(&self, node_url: &str, worker_names: &[String]) -> OrchestratorResult<()>;

    /// Worker意外退出
    async fn worker_down(&self, node_url: &str, worker_name: &str) -> OrchestratorResult<()>;
}
