use serde::{Deserialize, Serialize};

/// 消息代理类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BrokerType {
    #[default]
    InMemory,
    Rabbitmq,
    RedisStream,
}

impl BrokerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokerType::InMemory => "in_memory",
            BrokerType::Rabbitmq => "rabbitmq",
            BrokerType::RedisStream => "redis_stream",
        }
    }
}

/// Redis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub database: i64,
    pub password: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            database: 0,
            password: None,
        }
    }
}

impl RedisConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.host.is_empty() {
            return Err(anyhow::anyhow!("Redis主机地址不能为空"));
        }
        if self.port == 0 {
            return Err(anyhow::anyhow!("Redis端口必须大于0"));
        }
        if self.database < 0 {
            return Err(anyhow::anyhow!("Redis数据库索引不能为负数"));
        }
        Ok(())
    }

    /// Build Redis connection URL
    pub fn build_url(&self) -> String {
        let auth = match &self.password {
            Some(password) => format!(":{password}@"),
            None => String::new(),
        };
        format!("redis://{}{}:{}/{}", auth, self.host, self.port, self.database)
    }
}

/// 消息代理配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    #[serde(rename = "type", default)]
    pub r#type: BrokerType,
    /// AMQP 或 Redis 连接地址，Redis 也可以通过 `redis` 分项配置
    pub url: String,
    pub redis: Option<RedisConfig>,
    /// Redis Streams 消费组名称
    pub consumer_group: String,
    /// 内存队列容量上限，超出时发布失败
    pub max_queue_size: Option<usize>,
    /// 建立连接时的最大尝试次数
    pub connect_max_attempts: u32,
    pub connect_retry_delay_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            r#type: BrokerType::default(),
            url: String::new(),
            redis: None,
            consumer_group: "orchestrator".to_string(),
            max_queue_size: None,
            connect_max_attempts: 3,
            connect_retry_delay_ms: 500,
        }
    }
}

impl BrokerConfig {
    pub fn in_memory() -> Self {
        Self::default()
    }

    pub fn rabbitmq(url: impl Into<String>) -> Self {
        Self {
            r#type: BrokerType::Rabbitmq,
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn redis_stream(url: impl Into<String>) -> Self {
        Self {
            r#type: BrokerType::RedisStream,
            url: url.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.connect_max_attempts == 0 {
            return Err(anyhow::anyhow!("连接尝试次数必须大于0"));
        }

        match self.r#type {
            BrokerType::InMemory => {
                if self.max_queue_size == Some(0) {
                    return Err(anyhow::anyhow!("内存队列容量必须大于0"));
                }
            }
            BrokerType::Rabbitmq => {
                if self.url.is_empty() {
                    return Err(anyhow::anyhow!("RabbitMQ URL不能为空"));
                }
                if !self.url.starts_with("amqp://") && !self.url.starts_with("amqps://") {
                    return Err(anyhow::anyhow!("RabbitMQ URL必须是AMQP格式"));
                }
            }
            BrokerType::RedisStream => {
                if !self.url.is_empty()
                    && !self.url.starts_with("redis://")
                    && !self.url.starts_with("rediss://")
                {
                    return Err(anyhow::anyhow!("Redis URL必须是redis://或rediss://格式"));
                }
                match &self.redis {
                    Some(redis) => redis.validate()?,
                    None if self.url.is_empty() => {
                        return Err(anyhow::anyhow!(
                            "使用Redis Stream时，必须提供URL或redis配置"
                        ));
                    }
                    None => {}
                }
                if self.consumer_group.is_empty() {
                    return Err(anyhow::anyhow!("Redis消费组名称不能为空"));
                }
            }
        }

        Ok(())
    }

    /// Redis 连接地址，`url` 优先
    pub fn redis_url(&self) -> Option<String> {
        if self.r#type != BrokerType::RedisStream {
            return None;
        }
        if !self.url.is_empty() {
            Some(self.url.clone())
        } else {
            self.redis.as_ref().map(RedisConfig::build_url)
        }
    }
}

/// 消费端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// 发布时未显式指定时使用的最大重试次数
    pub max_retries: u32,
    /// 死信队列后缀，死信队列名为 `{queue}{dlq_suffix}`
    pub dlq_suffix: String,
    /// 队列为空时的初始等待
    pub poll_initial_delay_ms: u64,
    pub poll_max_delay_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: crate::models::DEFAULT_MAX_RETRIES,
            dlq_suffix: crate::models::DEFAULT_DLQ_SUFFIX.to_string(),
            poll_initial_delay_ms: 100,
            poll_max_delay_ms: 5_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl ConsumerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.dlq_suffix.is_empty() {
            return Err(anyhow::anyhow!("死信队列后缀不能为空"));
        }
        if self.poll_initial_delay_ms == 0 {
            return Err(anyhow::anyhow!("轮询初始间隔必须大于0"));
        }
        if self.poll_max_delay_ms < self.poll_initial_delay_ms {
            return Err(anyhow::anyhow!("轮询最大间隔不能小于初始间隔"));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(anyhow::anyhow!("退避倍数不能小于1"));
        }
        Ok(())
    }
}
