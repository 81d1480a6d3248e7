//! # Orchestrator Cluster
//!
//! 集群管理器：Worker类型注册、节点注册、端口分配与回收，
//! 以及基于心跳的失效检测。

pub mod health_monitor;
pub mod manager;

pub use health_monitor::HealthMonitor;
pub use manager::ClusterManager;
