//! HTTP请求/响应体

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterWorkerTypeRequest {
    pub worker_name: String,
    pub worker_class: String,
    #[serde(default)]
    pub worker_params: serde_json::Value,
    pub job_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub node_url: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LaunchWorkerRequest {
    pub node_url: String,
    pub worker_type: String,
    /// 不指定时由管理器分配端口
    #[serde(default)]
    pub worker_url: Option<String>,
    pub worker_name: String,
}

/// 指向某节点上一个Worker，用于终止与宕机上报
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRef {
    pub node_url: String,
    pub worker_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeRef {
    pub node_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub node_url: String,
    #[serde(default)]
    pub worker_names: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub touched: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerQuery {
    pub node_url: Option<String>,
}

/// 节点代理终止单个Worker
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeShutdownRequest {
    pub worker_name: String,
}
