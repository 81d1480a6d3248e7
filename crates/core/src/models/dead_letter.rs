use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use super::JobMessage;
use crate::errors::{OrchestratorError, OrchestratorResult};

/// 死信记录在DLQ中使用的作业类型
pub const DEAD_LETTER_JOB_TYPE: &str = "dead_letter";

/// 无法解析的原始消息体在死信记录中使用的作业类型
pub const UNPARSEABLE_JOB_TYPE: &str = "unparseable";

/// 死信记录，写入后不可变
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeadLetterRecord {
    pub id: String,
    pub source_queue: String,
    pub error_details: String,
    /// 原始消息体（含最终的重试次数）
    pub message: JobMessage,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(source_queue: &str, message: JobMessage, error_details: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            source_queue: source_queue.to_string(),
            error_details: error_details.into(),
            message,
            failed_at: Utc::now(),
        }
    }

    /// 无法解析为消息信封的原始消息体，原样保存在 `payload.raw_body`
    pub fn unparseable(source_queue: &str, raw_body: &[u8], error_details: impl Into<String>) -> Self {
        let body = String::from_utf8_lossy(raw_body).into_owned();
        let message = JobMessage::new(UNPARSEABLE_JOB_TYPE, json!({ "raw_body": body }), 0);
        Self::new(source_queue, message, error_details)
    }

    /// 包装为可在DLQ上传输的消息，关联ID沿用原始消息
    pub fn to_message(&self) -> OrchestratorResult<JobMessage> {
        let payload = serde_json::to_value(self)?;
        Ok(JobMessage {
            id: self.id.clone(),
            job_type: DEAD_LETTER_JOB_TYPE.to_string(),
            payload,
            retry_count: 0,
            max_retries: 0,
            correlation_id: self.message.correlation_id,
            created_at: self.failed_at,
        })
    }

    /// 从DLQ消息中还原死信记录
    pub fn from_message(message: &JobMessage) -> OrchestratorResult<Self> {
        if message.job_type != DEAD_LETTER_JOB_TYPE {
            return Err(OrchestratorError::Validation(format!(
                "消息 {} 不是死信记录 (job_type: {})",
                message.id, message.job_type
            )));
        }
        serde_json::from_value(message.payload.clone())
            .map_err(|e| OrchestratorError::Serialization(format!("解析死信记录失败: {e}")))
    }
}
