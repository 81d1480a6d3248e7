use serde::{Deserialize, Serialize};

/// 队列声明选项
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueOptions {
    pub durable: bool,
    /// 绑定的交换机（仅支持交换机的后端生效）
    pub exchange: Option<String>,
    pub routing_key: Option<String>,
    /// 队列最大长度，超出时发布失败
    pub max_length: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            durable: true,
            exchange: None,
            routing_key: None,
            max_length: None,
        }
    }
}

impl QueueOptions {
    pub fn bound_to(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: Some(exchange.into()),
            routing_key: Some(routing_key.into()),
            ..Default::default()
        }
    }
}

/// 队列描述
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QueueDescriptor {
    pub name: String,
    pub exchange: Option<String>,
    pub durable: bool,
    /// 声明时刻的消息数量（部分后端为近似值）
    pub message_count: u64,
}

/// 交换机类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        }
    }
}

/// 默认死信队列后缀
pub const DEFAULT_DLQ_SUFFIX: &str = ".dlq";

/// 死信队列命名：`{queue}{suffix}`
pub fn dead_letter_queue_name(queue: &str, suffix: &str) -> String {
    format!("{queue}{suffix}")
}
