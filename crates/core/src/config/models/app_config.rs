use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    cluster_node::{ClusterConfig, NodeConfig},
    message_queue::{BrokerConfig, ConsumerConfig},
    observability::ObservabilityConfig,
};

/// 环境变量前缀，层级用双下划线分隔，如 `ORCHESTRATOR__NODE__PORT_RANGE_START`
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub consumer: ConsumerConfig,
    pub cluster: ClusterConfig,
    pub node: NodeConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: ORCHESTRATOR__)
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults = ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        match config_path {
            Some(path) => {
                if !Path::new(path).exists() {
                    return Err(anyhow::anyhow!("配置文件不存在: {}", path));
                }
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
            None => {
                let default_paths = ["config/orchestrator.toml", "orchestrator.toml"];
                if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.broker.validate().context("消息代理配置验证失败")?;
        self.consumer.validate().context("消费端配置验证失败")?;
        self.cluster.validate().context("集群管理器配置验证失败")?;
        self.node.validate().context("节点代理配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;
        Ok(())
    }
}
