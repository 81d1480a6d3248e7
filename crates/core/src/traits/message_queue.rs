use async_trait::async_trait;

use crate::{
    errors::OrchestratorResult,
    models::{DeadLetterRecord, Delivery, ExchangeKind, JobMessage, QueueDescriptor, QueueOptions},
};

/// 代理连接抽象
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// 代理类型标识
    fn broker_kind(&self) -> &'static str;

    /// 连接是否仍然可用
    fn is_connected(&self) -> bool;

    /// 关闭连接
    async fn close(&self) -> OrchestratorResult<()>;
}

/// 与具体代理无关的队列生命周期与消息传输接口
///
/// 所有操作在连接丢失时立即失败（`BrokerUnavailable`），重试策略由消费端负责。
#[async_trait]
pub trait QueueBroker: Send + Sync {
    /// 后端名称
    fn backend_name(&self) -> &'static str;

    /// 声明队列，幂等且不会丢弃已有消息
    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> OrchestratorResult<QueueDescriptor>;

    /// 发布消息到已声明的队列，返回消息ID
    async fn publish(&self, queue: &str, message: &JobMessage) -> OrchestratorResult<String>;

    /// 非阻塞拉取一条消息，队列为空时返回 `None`
    async fn receive_message(&self, queue: &str) -> OrchestratorResult<Option<Delivery>>;

    /// 确认消息处理完成，消息从队列中移除
    async fn ack(&self, delivery: &Delivery) -> OrchestratorResult<()>;

    /// 放弃一条投递；`requeue` 为真时消息重新变为可接收，否则直接丢弃
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> OrchestratorResult<()>;

    /// 以递增重试次数后的消息替换原投递，返回消息ID
    ///
    /// 新副本写入成功后才移除原投递；失败时原投递保持未确认。
    async fn requeue(&self, delivery: &Delivery, message: &JobMessage) -> OrchestratorResult<String> {
        let message_id = self.publish(&delivery.queue, message).await?;
        self.ack(delivery).await?;
        Ok(message_id)
    }

    /// 清空队列，队列本身保留
    async fn clean_queue(&self, queue: &str) -> OrchestratorResult<()>;

    /// 删除队列
    async fn delete_queue(&self, queue: &str) -> OrchestratorResult<()>;

    /// 获取队列中的消息数量（部分后端为近似值，仅用于观测）
    async fn count_queue_messages(&self, queue: &str) -> OrchestratorResult<u64>;

    /// 将消息转入死信队列并从源队列移除
    ///
    /// 跨后端不变式：终态副本恰好一份，要么在源队列，要么在死信队列。
    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq_name: &str,
        delivery: &Delivery,
        error_details: &str,
    ) -> OrchestratorResult<DeadLetterRecord>;

    /// 声明交换机
    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> OrchestratorResult<()>;

    /// 删除交换机
    async fn delete_exchange(&self, exchange: &str) -> OrchestratorResult<()>;

    /// 统计交换机数量
    async fn count_exchanges(&self) -> OrchestratorResult<u64>;
}
