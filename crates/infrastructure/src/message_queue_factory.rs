use std::sync::Arc;

use orchestrator_core::{
    config::{BrokerConfig, BrokerType},
    BrokerConnection, OrchestratorError, OrchestratorResult, QueueBroker, DEFAULT_DLQ_SUFFIX,
};
use tracing::{debug, info};

use crate::{
    connection::{RabbitMqConnection, ReconnectPolicy, RedisConnection},
    InMemoryBroker, RabbitMqBroker, RedisStreamBroker,
};

/// 代理及其底层连接
#[derive(Clone)]
pub struct BrokerHandle {
    pub broker: Arc<dyn QueueBroker>,
    /// 内存代理没有连接
    pub connection: Option<Arc<dyn BrokerConnection>>,
}

impl BrokerHandle {
    pub async fn close(&self) -> OrchestratorResult<()> {
        match &self.connection {
            Some(connection) => connection.close().await,
            None => Ok(()),
        }
    }
}

pub struct BrokerFactory;

impl BrokerFactory {
    pub async fn create(config: &BrokerConfig) -> OrchestratorResult<BrokerHandle> {
        Self::create_with_dlq_suffix(config, DEFAULT_DLQ_SUFFIX).await
    }

    /// 无法解析的消息由代理写入 `{queue}{dlq_suffix}`，应与消费端使用同一后缀
    pub async fn create_with_dlq_suffix(
        config: &BrokerConfig,
        dlq_suffix: &str,
    ) -> OrchestratorResult<BrokerHandle> {
        Self::validate_config(config)?;
        debug!("Creating broker with type: {:?}", config.r#type);
        let policy = ReconnectPolicy::from_config(config);

        match config.r#type {
            BrokerType::InMemory => {
                info!("Initializing in-memory broker");
                Ok(BrokerHandle {
                    broker: Arc::new(InMemoryBroker::with_max_queue_size(config.max_queue_size)),
                    connection: None,
                })
            }
            BrokerType::Rabbitmq => {
                info!("Initializing RabbitMQ broker");
                let connection = Arc::new(RabbitMqConnection::connect(&config.url, &policy).await?);
                let broker = RabbitMqBroker::new(Arc::clone(&connection))
                    .await?
                    .with_dlq_suffix(dlq_suffix);
                Ok(BrokerHandle {
                    broker: Arc::new(broker),
                    connection: Some(connection),
                })
            }
            BrokerType::RedisStream => {
                info!("Initializing Redis Stream broker");
                let url = config.redis_url().ok_or_else(|| {
                    OrchestratorError::Configuration(
                        "Redis Stream配置缺失：需要提供redis配置段或有效的Redis URL".to_string(),
                    )
                })?;
                let connection = Arc::new(RedisConnection::connect(&url, &policy).await?);
                let broker = RedisStreamBroker::new(Arc::clone(&connection), &config.consumer_group)
                    .with_dlq_suffix(dlq_suffix);
                Ok(BrokerHandle {
                    broker: Arc::new(broker),
                    connection: Some(connection),
                })
            }
        }
    }

    pub fn validate_config(config: &BrokerConfig) -> OrchestratorResult<()> {
        config
            .validate()
            .map_err(|e| OrchestratorError::Configuration(e.to_string()))
    }

    pub fn parse_type_string(type_str: &str) -> OrchestratorResult<BrokerType> {
        match type_str.to_lowercase().as_str() {
            "in_memory" | "memory" => Ok(BrokerType::InMemory),
            "rabbitmq" => Ok(BrokerType::Rabbitmq),
            "redis_stream" | "redis" => Ok(BrokerType::RedisStream),
            _ => Err(OrchestratorError::Configuration(format!(
                "不支持的消息代理类型: {type_str}，支持的类型: in_memory, rabbitmq, redis_stream"
            ))),
        }
    }
}
