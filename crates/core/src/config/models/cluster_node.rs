use serde::{Deserialize, Serialize};

/// 集群状态存储类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum StoreType {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub bind_address: String,
    pub store: StoreType,
    pub database_url: String,
    pub heartbeat_timeout_seconds: i64,
    pub health_check_interval_seconds: u64,
    pub node_request_timeout_seconds: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8100".to_string(),
            store: StoreType::default(),
            database_url: "sqlite://orchestrator.db?mode=rwc".to_string(),
            heartbeat_timeout_seconds: 90,
            health_check_interval_seconds: 30,
            node_request_timeout_seconds: 30,
        }
    }
}

impl ClusterConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.bind_address.is_empty() {
            return Err(anyhow::anyhow!("集群管理器监听地址不能为空"));
        }
        if self.store == StoreType::Sqlite && !self.database_url.starts_with("sqlite:") {
            return Err(anyhow::anyhow!(
                "SQLite存储需要sqlite:开头的数据库地址: {}",
                self.database_url
            ));
        }
        if self.heartbeat_timeout_seconds <= 0 {
            return Err(anyhow::anyhow!("心跳超时时间必须大于0"));
        }
        if self.health_check_interval_seconds == 0 {
            return Err(anyhow::anyhow!("健康检查间隔必须大于0"));
        }
        if self.node_request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("节点请求超时时间必须大于0"));
        }
        Ok(())
    }
}

/// Worker 启动方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LauncherType {
    #[default]
    InProcess,
    Subprocess,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub bind_address: String,
    /// 对外公布的节点地址，Worker 地址沿用其主机名
    pub node_url: String,
    pub cluster_url: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// 启动时向集群管理器注册本节点
    pub register_on_start: bool,
    pub heartbeat_interval_seconds: u64,
    pub launcher: LauncherType,
    /// Worker 健康检查的最长等待
    pub launch_timeout_seconds: u64,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8110".to_string(),
            node_url: "http://127.0.0.1:8110".to_string(),
            cluster_url: "http://127.0.0.1:8100".to_string(),
            port_range_start: 8200,
            port_range_end: 8210,
            register_on_start: true,
            heartbeat_interval_seconds: 30,
            launcher: LauncherType::default(),
            launch_timeout_seconds: 10,
        }
    }
}

impl NodeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node_url.is_empty() {
            return Err(anyhow::anyhow!("节点地址不能为空"));
        }
        url::Url::parse(&self.node_url)
            .map_err(|e| anyhow::anyhow!("节点地址无效 {}: {e}", self.node_url))?;
        url::Url::parse(&self.cluster_url)
            .map_err(|e| anyhow::anyhow!("集群管理器地址无效 {}: {e}", self.cluster_url))?;
        if self.port_range_start == 0 || self.port_range_start > self.port_range_end {
            return Err(anyhow::anyhow!(
                "端口范围无效: {}-{}",
                self.port_range_start,
                self.port_range_end
            ));
        }
        if self.heartbeat_interval_seconds == 0 {
            return Err(anyhow::anyhow!("心跳间隔必须大于0"));
        }
        if self.launch_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("Worker启动超时时间必须大于0"));
        }
        Ok(())
    }
}
