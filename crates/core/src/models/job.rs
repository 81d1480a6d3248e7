use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use crate::errors::{OrchestratorError, OrchestratorResult};

/// 默认最大重试次数
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// 带类型的作业负载
///
/// 每种作业类型对应一个实现，`JOB_TYPE` 即队列/作业判别字段。
pub trait JobPayload: Serialize + DeserializeOwned + Send + Sync {
    const JOB_TYPE: &'static str;

    /// 业务层面的负载校验，返回错误描述
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// 作业消息信封
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMessage {
    pub id: String,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub retry_count: u32,
    pub max_retries: u32,
    pub correlation_id: Uuid,
    pub created_at: DateTime<Utc>,
}

impl JobMessage {
    pub fn new(job_type: impl Into<String>, payload: serde_json::Value, max_retries: u32) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            job_type: job_type.into(),
            payload,
            retry_count: 0,
            max_retries,
            correlation_id: Uuid::new_v4(),
            created_at: Utc::now(),
        }
    }

    /// 从带类型的负载构造消息，构造前执行负载校验
    pub fn typed<P: JobPayload>(payload: &P, max_retries: u32) -> OrchestratorResult<Self> {
        payload
            .validate()
            .map_err(|e| OrchestratorError::Validation(format!("{}: {e}", P::JOB_TYPE)))?;
        let value = serde_json::to_value(payload)?;
        Ok(Self::new(P::JOB_TYPE, value, max_retries))
    }

    pub fn with_correlation_id(mut self, correlation_id: Uuid) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    /// 按具体类型解析负载
    pub fn payload_as<P: JobPayload>(&self) -> OrchestratorResult<P> {
        if self.job_type != P::JOB_TYPE {
            return Err(OrchestratorError::Validation(format!(
                "作业类型不匹配: 期望 {}, 实际 {}",
                P::JOB_TYPE,
                self.job_type
            )));
        }
        serde_json::from_value(self.payload.clone())
            .map_err(|e| OrchestratorError::Validation(format!("解析作业负载失败: {e}")))
    }

    pub fn increment_retry(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    /// 递增后的重试次数是否仍在策略允许范围内
    pub fn can_retry(&self) -> bool {
        self.retry_count <= self.max_retries
    }

    /// 信封层面的校验
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.id.is_empty() {
            return Err(OrchestratorError::Validation("消息ID不能为空".to_string()));
        }
        if self.job_type.trim().is_empty() {
            return Err(OrchestratorError::Validation("作业类型不能为空".to_string()));
        }
        if self.payload.is_null() {
            return Err(OrchestratorError::Validation("作业负载不能为空".to_string()));
        }
        if self.retry_count > self.max_retries.saturating_add(1) {
            return Err(OrchestratorError::Validation(format!(
                "重试次数 {} 超出上限 {}",
                self.retry_count, self.max_retries
            )));
        }
        Ok(())
    }

    pub fn serialize_bytes(&self) -> OrchestratorResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| OrchestratorError::Serialization(format!("序列化消息失败: {e}")))
    }

    pub fn deserialize_bytes(bytes: &[u8]) -> OrchestratorResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| OrchestratorError::Serialization(format!("反序列化消息失败: {e}")))
    }
}

/// 已接收、尚未确认的消息
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    /// 后端确认凭据（AMQP delivery tag、Stream条目ID或内存序号）
    pub receipt: String,
    pub message: JobMessage,
}

impl Delivery {
    pub fn new(queue: impl Into<String>, receipt: impl Into<String>, message: JobMessage) -> Self {
        Self {
            queue: queue.into(),
            receipt: receipt.into(),
            message,
        }
    }
}
