use thiserror::Error;

/// 编排系统错误类型定义
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("消息代理不可用: {0}")]
    BrokerUnavailable(String),

    #[error("队列未找到: {queue}")]
    QueueNotFound { queue: String },

    #[error("消息发布失败: {0}")]
    Publish(String),

    #[error("后端 {backend} 不支持操作: {operation}")]
    NotImplemented {
        backend: &'static str,
        operation: &'static str,
    },

    #[error("资源冲突: {0}")]
    Conflict(String),

    #[error("节点 {node_url} 没有可用端口 (范围 {range_start}-{range_end})")]
    NoFreePort {
        node_url: String,
        range_start: u16,
        range_end: u16,
    },

    #[error("节点未注册: {node_url}")]
    NodeNotFound { node_url: String },

    #[error("Worker类型未找到: {name}")]
    WorkerTypeNotFound { name: String },

    #[error("Worker未找到: {name}")]
    WorkerNotFound { name: String },

    #[error("Worker启动失败: {0}")]
    WorkerLaunch(String),

    #[error("消息校验失败: {0}")]
    Validation(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("网络错误: {0}")]
    Network(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("作业执行错误: {0}")]
    JobExecution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl OrchestratorError {
    /// 跨HTTP边界使用的错误码
    pub fn code(&self) -> &'static str {
        match self {
            OrchestratorError::BrokerUnavailable(_) => "BROKER_UNAVAILABLE",
            OrchestratorError::QueueNotFound { .. } => "QUEUE_NOT_FOUND",
            OrchestratorError::Publish(_) => "PUBLISH_ERROR",
            OrchestratorError::NotImplemented { .. } => "NOT_IMPLEMENTED",
            OrchestratorError::Conflict(_) => "CONFLICT",
            OrchestratorError::NoFreePort { .. } => "NO_FREE_PORT",
            OrchestratorError::NodeNotFound { .. } => "NODE_NOT_FOUND",
            OrchestratorError::WorkerTypeNotFound { .. } => "WORKER_TYPE_NOT_FOUND",
            OrchestratorError::WorkerNotFound { .. } => "WORKER_NOT_FOUND",
            OrchestratorError::WorkerLaunch(_) => "WORKER_LAUNCH_FAILED",
            OrchestratorError::Validation(_) => "VALIDATION_ERROR",
            OrchestratorError::Serialization(_) => "SERIALIZATION_ERROR",
            OrchestratorError::Configuration(_) => "CONFIGURATION_ERROR",
            OrchestratorError::Network(_) => "NETWORK_ERROR",
            OrchestratorError::Database(_) => "DATABASE_ERROR",
            OrchestratorError::JobExecution(_) => "JOB_EXECUTION_ERROR",
            OrchestratorError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// 由远端返回的错误码还原错误
    ///
    /// 结构化字段无法从文本中恢复的变体会退化为携带原始消息的近似变体。
    pub fn from_code(code: &str, message: String) -> Self {
        match code {
            "BROKER_UNAVAILABLE" => OrchestratorError::BrokerUnavailable(message),
            "QUEUE_NOT_FOUND" => OrchestratorError::QueueNotFound { queue: message },
            "PUBLISH_ERROR" => OrchestratorError::Publish(message),
            "CONFLICT" => OrchestratorError::Conflict(message),
            "NO_FREE_PORT" => OrchestratorError::NoFreePort {
                node_url: message,
                range_start: 0,
                range_end: 0,
            },
            "NODE_NOT_FOUND" => OrchestratorError::NodeNotFound { node_url: message },
            "WORKER_TYPE_NOT_FOUND" => OrchestratorError::WorkerTypeNotFound { name: message },
            "WORKER_NOT_FOUND" => OrchestratorError::WorkerNotFound { name: message },
            "WORKER_LAUNCH_FAILED" => OrchestratorError::WorkerLaunch(message),
            "VALIDATION_ERROR" => OrchestratorError::Validation(message),
            "SERIALIZATION_ERROR" => OrchestratorError::Serialization(message),
            "CONFIGURATION_ERROR" => OrchestratorError::Configuration(message),
            "NETWORK_ERROR" => OrchestratorError::Network(message),
            "JOB_EXECUTION_ERROR" => OrchestratorError::JobExecution(message),
            _ => OrchestratorError::Internal(message),
        }
    }

    /// 是否属于客户端可以通过换节点/修正请求解决的错误
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            OrchestratorError::QueueNotFound { .. }
                | OrchestratorError::Conflict(_)
                | OrchestratorError::NoFreePort { .. }
                | OrchestratorError::NodeNotFound { .. }
                | OrchestratorError::WorkerTypeNotFound { .. }
                | OrchestratorError::WorkerNotFound { .. }
                | OrchestratorError::Validation(_)
                | OrchestratorError::Configuration(_)
                | OrchestratorError::NotImplemented { .. }
        )
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(e: serde_json::Error) -> Self {
        OrchestratorError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type OrchestratorResult<T> = std::result::Result<T, OrchestratorError>;
