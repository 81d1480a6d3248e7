use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{OrchestratorError, OrchestratorResult};

/// Worker类型注册信息（模板）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerTypeRegistration {
    pub worker_name: String,
    /// 节点本地WorkerRegistry中的实现名
    pub worker_class: String,
    pub worker_params: serde_json::Value,
    pub job_type: String,
    pub registered_at: DateTime<Utc>,
}

impl WorkerTypeRegistration {
    pub fn new(
        worker_name: impl Into<String>,
        worker_class: impl Into<String>,
        worker_params: serde_json::Value,
        job_type: impl Into<String>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            worker_class: worker_class.into(),
            worker_params,
            job_type: job_type.into(),
            registered_at: Utc::now(),
        }
    }
}

/// Worker实例状态
///
/// ```text
/// Starting → Available → Down
/// ```
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum WorkerStatus {
    #[serde(rename = "STARTING")]
    Starting,
    #[serde(rename = "AVAILABLE")]
    Available,
    #[serde(rename = "DOWN")]
    Down,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkerStatus::Starting => "STARTING",
            WorkerStatus::Available => "AVAILABLE",
            WorkerStatus::Down => "DOWN",
        }
    }

    /// 非Down状态的实例占用端口
    pub fn occupies_port(&self) -> bool {
        !matches!(self, WorkerStatus::Down)
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WorkerStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "STARTING" => Ok(WorkerStatus::Starting),
            "AVAILABLE" => Ok(WorkerStatus::Available),
            "DOWN" => Ok(WorkerStatus::Down),
            _ => Err(OrchestratorError::Serialization(format!(
                "无效的Worker状态: {s}"
            ))),
        }
    }
}

/// Worker实例
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerInstance {
    pub worker_url: String,
    pub node_url: String,
    pub port: u16,
    pub worker_name: String,
    pub worker_type: String,
    pub status: WorkerStatus,
    pub launched_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerInstance {
    pub fn starting(
        node_url: &str,
        worker_url: &str,
        port: u16,
        worker_name: &str,
        worker_type: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            worker_url: worker_url.to_string(),
            node_url: node_url.to_string(),
            port,
            worker_name: worker_name.to_string(),
            worker_type: worker_type.to_string(),
            status: WorkerStatus::Starting,
            launched_at: now,
            last_heartbeat: now,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.occupies_port()
    }

    /// 检查心跳是否超时
    pub fn is_heartbeat_expired(&self, now: DateTime<Utc>, timeout_seconds: i64) -> bool {
        (now - self.last_heartbeat).num_seconds() > timeout_seconds
    }
}

/// 节点注册信息
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeRegistration {
    pub node_url: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    pub registered_at: DateTime<Utc>,
}

impl NodeRegistration {
    pub fn new(node_url: impl Into<String>, port_range_start: u16, port_range_end: u16) -> OrchestratorResult<Self> {
        let node_url = node_url.into();
        if port_range_start == 0 || port_range_start > port_range_end {
            return Err(OrchestratorError::Validation(format!(
                "节点 {node_url} 的端口范围无效: {port_range_start}-{port_range_end}"
            )));
        }
        parse_host(&node_url)?;
        Ok(Self {
            node_url,
            port_range_start,
            port_range_end,
            registered_at: Utc::now(),
        })
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.port_range_start..=self.port_range_end).contains(&port)
    }

    /// 在该节点主机上拼出指定端口的Worker地址
    pub fn worker_url_for(&self, port: u16) -> OrchestratorResult<String> {
        let url = url::Url::parse(&self.node_url)
            .map_err(|e| OrchestratorError::Validation(format!("无效的节点地址 {}: {e}", self.node_url)))?;
        let host = url.host_str().ok_or_else(|| {
            OrchestratorError::Validation(format!("节点地址缺少主机: {}", self.node_url))
        })?;
        Ok(format!("{}://{}:{}", url.scheme(), host, port))
    }
}

/// 节点及其已分配端口视图
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NodeStatus {
    pub registration: NodeRegistration,
    pub assigned_ports: Vec<u16>,
}

/// 管理器下发给节点代理的启动指令
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LaunchRequest {
    pub worker_name: String,
    pub worker_type: String,
    pub worker_class: String,
    pub worker_params: serde_json::Value,
    pub job_type: String,
    pub worker_url: String,
}

/// 节点代理上报的Worker状态
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerReport {
    pub worker_name: String,
    pub worker_url: String,
    pub port: u16,
    pub status: WorkerStatus,
}

fn parse_host(raw: &str) -> OrchestratorResult<url::Url> {
    let url = url::Url::parse(raw)
        .map_err(|e| OrchestratorError::Validation(format!("无效的地址 {raw}: {e}")))?;
    if url.host_str().is_none() {
        return Err(OrchestratorError::Validation(format!("地址缺少主机: {raw}")));
    }
    Ok(url)
}

/// 解析Worker地址中的端口
pub fn parse_worker_port(worker_url: &str) -> OrchestratorResult<u16> {
    let url = parse_host(worker_url)?;
    url.port_or_known_default().ok_or_else(|| {
        OrchestratorError::Validation(format!("Worker地址缺少端口: {worker_url}"))
    })
}

/// 解析Worker地址中的主机
pub fn parse_worker_host(worker_url: &str) -> OrchestratorResult<String> {
    let url = parse_host(worker_url)?;
    url.host_str()
        .map(|h| h.to_string())
        .ok_or_else(|| OrchestratorError::Validation(format!("地址缺少主机: {worker_url}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_registration_rejects_bad_range() {
        assert!(NodeRegistration::new("http://127.0.0.1:9000", 8202, 8200).is_err());
        assert!(NodeRegistration::new("http://127.0.0.1:9000", 0, 10).is_err());
        assert!(NodeRegistration::new("not a url", 8200, 8202).is_err());
    }

    #[test]
    fn test_worker_url_for_uses_node_host() {
        let node = NodeRegistration::new("http://10.0.0.7:9000", 8200, 8202).unwrap();
        assert_eq!(node.worker_url_for(8201).unwrap(), "http://10.0.0.7:8201");
        assert!(node.contains(8200));
        assert!(node.contains(8202));
        assert!(!node.contains(8203));
    }

    #[test]
    fn test_parse_worker_url() {
        assert_eq!(parse_worker_port("http://127.0.0.1:8200").unwrap(), 8200);
        assert_eq!(parse_worker_host("http://127.0.0.1:8200").unwrap(), "127.0.0.1");
        assert!(parse_worker_port("127.0.0.1").is_err());
    }

    #[test]
    fn test_status_round_trip_and_occupancy() {
        for status in [WorkerStatus::Starting, WorkerStatus::Available, WorkerStatus::Down] {
            assert_eq!(status.as_str().parse::<WorkerStatus>().unwrap(), status);
        }
        assert!(WorkerStatus::Starting.occupies_port());
        assert!(WorkerStatus::Available.occupies_port());
        assert!(!WorkerStatus::Down.occupies_port());
    }

    #[test]
    fn test_heartbeat_expiry() {
        let mut instance = WorkerInstance::starting("http://n:1", "http://n:8200", 8200, "w1", "echo");
        let now = Utc::now();
        instance.last_heartbeat = now - chrono::Duration::seconds(120);
        assert!(instance.is_heartbeat_expired(now, 90));
        assert!(!instance.is_heartbeat_expired(now, 180));
    }
}
