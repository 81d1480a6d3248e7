//! # 编排系统HTTP接口
//!
//! 集群管理器与节点代理的axum路由、错误到HTTP状态码的映射，以及
//! 两者之间使用的reqwest客户端。所有响应使用统一信封：
//!
//! ```json
//! {"success": true, "data": {...}, "error": null, "timestamp": "..."}
//! {"success": false, "data": null, "error": {"code": "NO_FREE_PORT", "message": "..."}, "timestamp": "..."}
//! ```
//!
//! 客户端按 `error.code` 还原 [`orchestrator_core::OrchestratorError`]，
//! 因此跨HTTP调用与进程内调用得到相同的错误变体。

pub mod client;
pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;
pub mod types;

pub use client::{ClusterApiClient, HttpClusterReporter, HttpNodeAgentClient, HttpNodeConnector};
pub use error::{ApiError, ApiJson, ApiResult};
pub use response::ApiResponse;
pub use routes::{create_cluster_routes, create_node_routes, ClusterState, NodeState};
