use std::sync::Arc;

use orchestrator_core::{
    JobMessage, JobPayload, OrchestratorResult, QueueBroker, DEFAULT_MAX_RETRIES,
};
use tracing::debug;

use crate::schema::SchemaRegistry;

/// 作业发布端，发布前执行模式校验
pub struct JobProducer {
    broker: Arc<dyn QueueBroker>,
    schemas: Arc<SchemaRegistry>,
    max_retries: u32,
}

impl JobProducer {
    pub fn new(broker: Arc<dyn QueueBroker>, schemas: Arc<SchemaRegistry>) -> Self {
        Self {
            broker,
            schemas,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// `publish_typed` 构造消息时使用的最大重试次数
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub async fn publish(&self, queue: &str, message: &JobMessage) -> OrchestratorResult<String> {
        self.schemas.validate(message)?;
        let id = self.broker.publish(queue, message).await?;
        debug!(
            "作业已发布: queue={}, id={}, job_type={}, correlation_id={}",
            queue, id, message.job_type, message.correlation_id
        );
        Ok(id)
    }

    pub async fn publish_typed<P: JobPayload>(&self, queue: &str, payload: &P) -> OrchestratorResult<String> {
        let message = JobMessage::typed(payload, self.max_retries)?;
        self.publish(queue, &message).await
    }
}
