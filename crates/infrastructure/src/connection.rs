//! 代理连接抽象
//!
//! 重连策略只作用于建立连接阶段；连接建立后任何操作失败都直接返回
//! `BrokerUnavailable`，由消费端统一退避。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use lapin::{options::ConfirmSelectOptions, Channel, Connection, ConnectionProperties};
use orchestrator_core::{
    config::BrokerConfig, BrokerConnection, OrchestratorError, OrchestratorResult,
};
use redis::{aio::ConnectionManager, Client};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// 建立连接时的重试策略
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            delay: Duration::from_millis(500),
        }
    }
}

impl ReconnectPolicy {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            max_attempts: config.connect_max_attempts.max(1),
            delay: Duration::from_millis(config.connect_retry_delay_ms),
        }
    }

    /// 只尝试一次
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }
}

/// 按策略反复尝试建立连接，全部失败时返回最后一次的错误
pub async fn connect_with_policy<T, F, Fut>(
    target: &str,
    policy: &ReconnectPolicy,
    mut connect: F,
) -> OrchestratorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = OrchestratorResult<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match connect().await {
            Ok(value) => {
                if attempt > 1 {
                    info!("第 {} 次尝试连接 {} 成功", attempt, target);
                }
                return Ok(value);
            }
            Err(e) => {
                if attempt < attempts {
                    warn!(
                        "连接 {} 失败 (尝试 {}/{}): {}，{:?} 后重试",
                        target, attempt, attempts, e, policy.delay
                    );
                    sleep(policy.delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    let message = format!(
        "连接 {} 失败，已尝试 {} 次: {}",
        target,
        attempts,
        last_error.map_or_else(|| "未知错误".to_string(), |e| e.to_string())
    );
    error!("{}", message);
    Err(OrchestratorError::BrokerUnavailable(message))
}

/// RabbitMQ 连接
pub struct RabbitMqConnection {
    connection: Connection,
    url: String,
}

impl RabbitMqConnection {
    pub async fn connect(url: &str, policy: &ReconnectPolicy) -> OrchestratorResult<Self> {
        let connection = connect_with_policy(url, policy, || async move {
            Connection::connect(url, ConnectionProperties::default())
                .await
                .map_err(|e| OrchestratorError::BrokerUnavailable(format!("连接RabbitMQ失败: {e}")))
        })
        .await?;

        info!("成功连接到RabbitMQ: {}", url);
        Ok(Self {
            connection,
            url: url.to_string(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// 获取开启了发布确认的新通道
    pub async fn create_channel(&self) -> OrchestratorResult<Channel> {
        if !self.is_connected() {
            return Err(OrchestratorError::BrokerUnavailable(format!(
                "RabbitMQ连接已断开: {}",
                self.url
            )));
        }

        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| OrchestratorError::BrokerUnavailable(format!("创建通道失败: {e}")))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| OrchestratorError::BrokerUnavailable(format!("开启发布确认失败: {e}")))?;

        debug!("已创建RabbitMQ通道 {}", channel.id());
        Ok(channel)
    }
}

#[async_trait]
impl BrokerConnection for RabbitMqConnection {
    fn broker_kind(&self) -> &'static str {
        "rabbitmq"
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.connection
            .close(200, "正常关闭")
            .await
            .map_err(|e| OrchestratorError::BrokerUnavailable(format!("关闭连接失败: {e}")))?;

        info!("RabbitMQ连接已关闭");
        Ok(())
    }
}

/// Redis 连接
///
/// 底层为 `ConnectionManager`，连接断开后在下一次命令时自动重建。
pub struct RedisConnection {
    client: Client,
    connection: ConnectionManager,
    closed: AtomicBool,
}

impl RedisConnection {
    pub async fn connect(url: &str, policy: &ReconnectPolicy) -> OrchestratorResult<Self> {
        let client = Client::open(url)
            .map_err(|e| OrchestratorError::Configuration(format!("无效的Redis地址 {url}: {e}")))?;

        let client_ref = &client;
        let connection = connect_with_policy(url, policy, move || async move {
            let mut conn = client_ref
                .get_connection_manager()
                .await
                .map_err(|e| redis_error("连接Redis失败", e))?;
            let pong: String = redis::cmd("PING")
                .query_async(&mut conn)
                .await
                .map_err(|e| redis_error("Redis PING失败", e))?;
            if pong != "PONG" {
                return Err(OrchestratorError::BrokerUnavailable(format!(
                    "Redis PING返回异常: {pong}"
                )));
            }
            Ok(conn)
        })
        .await?;

        info!("成功连接到Redis: {}", url);
        Ok(Self {
            client,
            connection,
            closed: AtomicBool::new(false),
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// 获取可并发使用的会话句柄
    pub fn session(&self) -> OrchestratorResult<ConnectionManager> {
        if self.closed.load(Ordering::Acquire) {
            return Err(OrchestratorError::BrokerUnavailable(
                "Redis连接已关闭".to_string(),
            ));
        }
        Ok(self.connection.clone())
    }
}

#[async_trait]
impl BrokerConnection for RedisConnection {
    fn broker_kind(&self) -> &'static str {
        "redis"
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    async fn close(&self) -> OrchestratorResult<()> {
        self.closed.store(true, Ordering::Release);
        info!("Redis连接已关闭");
        Ok(())
    }
}

/// 将 Redis 错误归类：传输层故障视为代理不可用
pub(crate) fn redis_error(context: &str, e: redis::RedisError) -> OrchestratorError {
    if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
    {
        OrchestratorError::BrokerUnavailable(format!("{context}: {e}"))
    } else {
        OrchestratorError::Internal(format!("{context}: {e}"))
    }
}
