use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use orchestrator_cluster::ClusterManager;
use orchestrator_core::NodeAgentApi;
use tower_http::trace::TraceLayer;

use crate::handlers::{cluster, health, node};

/// 集群管理器API状态
#[derive(Clone)]
pub struct ClusterState {
    pub manager: Arc<ClusterManager>,
}

/// 节点代理API状态
#[derive(Clone)]
pub struct NodeState {
    pub agent: Arc<dyn NodeAgentApi>,
    pub node_url: String,
}

/// 创建集群管理器路由
pub fn create_cluster_routes(state: ClusterState) -> Router {
    Router::new()
        .route("/health", get(health::cluster_health))
        // Worker类型
        .route(
            "/api/worker-types",
            get(cluster::list_worker_types).post(cluster::register_worker_type),
        )
        // 节点
        .route("/api/nodes", get(cluster::list_nodes).post(cluster::register_node))
        // Worker生命周期
        .route("/api/workers", get(cluster::list_workers))
        .route("/api/workers/launch", post(cluster::launch_worker))
        .route("/api/workers/shutdown", post(cluster::shutdown_worker))
        .route("/api/workers/shutdown-all", post(cluster::shutdown_all_workers))
        .route("/api/workers/heartbeat", post(cluster::worker_heartbeat))
        .route("/api/workers/down", post(cluster::worker_down))
        .route("/api/admin/clear-databases", post(cluster::clear_databases))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// 创建节点代理路由，仅供集群管理器调用
pub fn create_node_routes(state: NodeState) -> Router {
    Router::new()
        .route("/health", get(health::node_health))
        .route("/node/workers", get(node::list_workers))
        .route("/node/workers/launch", post(node::launch_worker))
        .route("/node/workers/shutdown", post(node::shutdown_worker))
        .route("/node/workers/shutdown-all", post(node::shutdown_all_workers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
