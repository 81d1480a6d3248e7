use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use orchestrator_core::{
    DeadLetterRecord, Delivery, ExchangeKind, JobMessage, OrchestratorError, OrchestratorResult,
    QueueBroker, QueueDescriptor, QueueOptions,
};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

const BACKEND: &str = "in_memory";

/// 内存消息代理
///
/// 适用于单进程部署与测试。每个队列由待投递的 FIFO 与已投递未确认的集合组成，
/// 死信转移在同一把写锁内完成。
#[derive(Debug, Default)]
pub struct InMemoryBroker {
    queues: RwLock<HashMap<String, QueueState>>,
    next_receipt: AtomicU64,
    /// 所有队列的默认容量上限
    max_queue_size: Option<usize>,
}

#[derive(Debug)]
struct QueueState {
    options: QueueOptions,
    ready: VecDeque<JobMessage>,
    in_flight: HashMap<u64, JobMessage>,
}

impl QueueState {
    fn new(options: QueueOptions) -> Self {
        Self {
            options,
            ready: VecDeque::new(),
            in_flight: HashMap::new(),
        }
    }

    fn capacity(&self, default_limit: Option<usize>) -> Option<usize> {
        self.options.max_length.or(default_limit)
    }

    fn descriptor(&self, name: &str) -> QueueDescriptor {
        QueueDescriptor {
            name: name.to_string(),
            exchange: None,
            durable: self.options.durable,
            message_count: self.ready.len() as u64,
        }
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_queue_size(max_queue_size: Option<usize>) -> Self {
        info!("创建内存消息代理，队列容量上限: {:?}", max_queue_size);
        Self {
            max_queue_size,
            ..Self::default()
        }
    }

    fn parse_receipt(delivery: &Delivery) -> OrchestratorResult<u64> {
        delivery.receipt.parse().map_err(|_| {
            OrchestratorError::Validation(format!("无效的投递凭证: {}", delivery.receipt))
        })
    }

    fn queue_not_found(queue: &str) -> OrchestratorError {
        OrchestratorError::QueueNotFound {
            queue: queue.to_string(),
        }
    }
}

#[async_trait]
impl QueueBroker for InMemoryBroker {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> OrchestratorResult<QueueDescriptor> {
        if options.exchange.is_some() {
            return Err(OrchestratorError::NotImplemented {
                backend: BACKEND,
                operation: "declare_queue_with_exchange",
            });
        }

        let mut queues = self.queues.write().await;
        let state = queues.entry(queue.to_string()).or_insert_with(|| {
            debug!("声明内存队列: {}", queue);
            QueueState::new(options.clone())
        });
        Ok(state.descriptor(queue))
    }

    async fn publish(&self, queue: &str, message: &JobMessage) -> OrchestratorResult<String> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| Self::queue_not_found(queue))?;

        if let Some(limit) = state.capacity(self.max_queue_size) {
            if state.ready.len() + state.in_flight.len() >= limit {
                return Err(OrchestratorError::Publish(format!(
                    "队列 {queue} 已满 (容量 {limit})"
                )));
            }
        }

        state.ready.push_back(message.clone());
        debug!("消息 {} 已发布到内存队列 {}", message.id, queue);
        Ok(message.id.clone())
    }

    async fn receive_message(&self, queue: &str) -> OrchestratorResult<Option<Delivery>> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| Self::queue_not_found(queue))?;

        let Some(message) = state.ready.pop_front() else {
            return Ok(None);
        };

        let receipt = self.next_receipt.fetch_add(1, Ordering::Relaxed);
        state.in_flight.insert(receipt, message.clone());
        Ok(Some(Delivery::new(queue, receipt.to_string(), message)))
    }

    async fn ack(&self, delivery: &Delivery) -> OrchestratorResult<()> {
        let receipt = Self::parse_receipt(delivery)?;
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| Self::queue_not_found(&delivery.queue))?;

        if state.in_flight.remove(&receipt).is_none() {
            return Err(OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, delivery.queue
            )));
        }
        debug!("消息 {} 已确认", delivery.message.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> OrchestratorResult<()> {
        let receipt = Self::parse_receipt(delivery)?;
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| Self::queue_not_found(&delivery.queue))?;

        let message = state.in_flight.remove(&receipt).ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, delivery.queue
            ))
        })?;
        if requeue {
            // 放回队首，下一次接收即可取到
            state.ready.push_front(message);
            debug!("消息 {} 已退回队列 {}", delivery.message.id, delivery.queue);
        } else {
            warn!("消息 {} 被拒绝并丢弃 (队列 {})", delivery.message.id, delivery.queue);
        }
        Ok(())
    }

    /// 原投递的占位直接让给新副本，不受容量上限约束
    async fn requeue(&self, delivery: &Delivery, message: &JobMessage) -> OrchestratorResult<String> {
        let receipt = Self::parse_receipt(delivery)?;
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(&delivery.queue)
            .ok_or_else(|| Self::queue_not_found(&delivery.queue))?;

        if state.in_flight.remove(&receipt).is_none() {
            return Err(OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, delivery.queue
            )));
        }
        state.ready.push_back(message.clone());
        debug!(
            "消息 {} 重新入队 {} (retry_count={})",
            message.id, delivery.queue, message.retry_count
        );
        Ok(message.id.clone())
    }

    async fn clean_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut queues = self.queues.write().await;
        let state = queues
            .get_mut(queue)
            .ok_or_else(|| Self::queue_not_found(queue))?;
        let removed = state.ready.len();
        state.ready.clear();
        info!("内存队列 {} 已清空，移除 {} 条消息", queue, removed);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut queues = self.queues.write().await;
        if queues.remove(queue).is_some() {
            info!("内存队列 {} 已删除", queue);
        } else {
            debug!("内存队列 {} 不存在，忽略删除", queue);
        }
        Ok(())
    }

    async fn count_queue_messages(&self, queue: &str) -> OrchestratorResult<u64> {
        let queues = self.queues.read().await;
        queues
            .get(queue)
            .map(|state| state.ready.len() as u64)
            .ok_or_else(|| Self::queue_not_found(queue))
    }

    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq_name: &str,
        delivery: &Delivery,
        error_details: &str,
    ) -> OrchestratorResult<DeadLetterRecord> {
        let receipt = Self::parse_receipt(delivery)?;
        let mut queues = self.queues.write().await;

        let source = queues
            .get(source_queue)
            .ok_or_else(|| Self::queue_not_found(source_queue))?;
        let original = source.in_flight.get(&receipt).cloned().ok_or_else(|| {
            OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, source_queue
            ))
        })?;

        let record = DeadLetterRecord::new(source_queue, original, error_details);
        let dead_letter = record.to_message()?;

        queues
            .entry(dlq_name.to_string())
            .or_insert_with(|| QueueState::new(QueueOptions::default()))
            .ready
            .push_back(dead_letter);
        if let Some(source) = queues.get_mut(source_queue) {
            source.in_flight.remove(&receipt);
        }

        info!(
            "消息 {} 已从 {} 转入死信队列 {}",
            delivery.message.id, source_queue, dlq_name
        );
        Ok(record)
    }

    async fn declare_exchange(&self, _exchange: &str, _kind: ExchangeKind) -> OrchestratorResult<()> {
        Err(OrchestratorError::NotImplemented {
            backend: BACKEND,
            operation: "declare_exchange",
        })
    }

    async fn delete_exchange(&self, _exchange: &str) -> OrchestratorResult<()> {
        Err(OrchestratorError::NotImplemented {
            backend: BACKEND,
            operation: "delete_exchange",
        })
    }

    async fn count_exchanges(&self) -> OrchestratorResult<u64> {
        Err(OrchestratorError::NotImplemented {
            backend: BACKEND,
            operation: "count_exchanges",
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_core::DEAD_LETTER_JOB_TYPE;
    use serde_json::json;

    async fn broker_with(queue: &str) -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker
            .declare_queue(queue, &QueueOptions::default())
            .await
            .unwrap();
        broker
    }

    fn job(n: i64) -> JobMessage {
        JobMessage::new("echo", json!({ "n": n }), 3)
    }

    #[tokio::test]
    async fn test_redeclare_keeps_messages() {
        let broker = broker_with("jobs").await;
        broker.publish("jobs", &job(1)).await.unwrap();

        let descriptor = broker
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        assert_eq!(descriptor.message_count, 1);
        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_publish_to_undeclared_queue_fails() {
        let broker = InMemoryBroker::new();
        let err = broker.publish("missing", &job(1)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueNotFound { .. }));
    }

    #[tokio::test]
    async fn test_receive_is_fifo_and_non_blocking() {
        let broker = broker_with("jobs").await;
        assert!(broker.receive_message("jobs").await.unwrap().is_none());

        for n in 0..3 {
            broker.publish("jobs", &job(n)).await.unwrap();
        }
        for n in 0..3 {
            let delivery = broker.receive_message("jobs").await.unwrap().unwrap();
            assert_eq!(delivery.message.payload["n"], n);
            broker.ack(&delivery).await.unwrap();
        }
        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_double_ack_is_rejected() {
        let broker = broker_with("jobs").await;
        broker.publish("jobs", &job(1)).await.unwrap();
        let delivery = broker.receive_message("jobs").await.unwrap().unwrap();

        broker.ack(&delivery).await.unwrap();
        assert!(broker.ack(&delivery).await.is_err());
    }

    #[tokio::test]
    async fn test_ack_after_delete_fails() {
        let broker = broker_with("jobs").await;
        broker.publish("jobs", &job(1)).await.unwrap();
        let delivery = broker.receive_message("jobs").await.unwrap().unwrap();

        broker.delete_queue("jobs").await.unwrap();
        let err = broker.ack(&delivery).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::QueueNotFound { .. }));
        assert!(broker.receive_message("jobs").await.is_err());
    }

    #[tokio::test]
    async fn test_clean_queue_keeps_queue() {
        let broker = broker_with("jobs").await;
        broker.publish("jobs", &job(1)).await.unwrap();
        broker.publish("jobs", &job(2)).await.unwrap();

        broker.clean_queue("jobs").await.unwrap();
        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 0);
        broker.publish("jobs", &job(3)).await.unwrap();
        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_publish() {
        let broker = InMemoryBroker::with_max_queue_size(Some(1));
        broker
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        broker.publish("jobs", &job(1)).await.unwrap();
        let err = broker.publish("jobs", &job(2)).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::Publish(_)));
    }

    #[tokio::test]
    async fn test_requeue_replaces_delivery_in_full_queue() {
        let broker = InMemoryBroker::with_max_queue_size(Some(1));
        broker
            .declare_queue("jobs", &QueueOptions::default())
            .await
            .unwrap();
        broker.publish("jobs", &job(1)).await.unwrap();
        let delivery = broker.receive_message("jobs").await.unwrap().unwrap();

        let mut retry = delivery.message.clone();
        retry.increment_retry();
        broker.requeue(&delivery, &retry).await.unwrap();

        assert!(broker.ack(&delivery).await.is_err());
        let again = broker.receive_message("jobs").await.unwrap().unwrap();
        assert_eq!(again.message.id, delivery.message.id);
        assert_eq!(again.message.retry_count, 1);
    }

    #[tokio::test]
    async fn test_nack_returns_message_to_front() {
        let broker = broker_with("jobs").await;
        broker.publish("jobs", &job(1)).await.unwrap();
        broker.publish("jobs", &job(2)).await.unwrap();

        let first = broker.receive_message("jobs").await.unwrap().unwrap();
        broker.nack(&first, true).await.unwrap();
        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 2);
        let again = broker.receive_message("jobs").await.unwrap().unwrap();
        assert_eq!(again.message.id, first.message.id);

        broker.nack(&again, false).await.unwrap();
        assert!(broker.nack(&again, true).await.is_err());
        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_move_to_dlq_leaves_single_copy() {
        let broker = broker_with("jobs").await;
        let original = job(42);
        broker.publish("jobs", &original).await.unwrap();
        let delivery = broker.receive_message("jobs").await.unwrap().unwrap();

        let record = broker
            .move_to_dlq("jobs", "jobs.dlq", &delivery, "ValueError: boom")
            .await
            .unwrap();
        assert_eq!(record.error_details, "ValueError: boom");
        assert_eq!(record.message.payload, original.payload);

        assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 0);
        assert!(broker.ack(&delivery).await.is_err());

        let dead = broker.receive_message("jobs.dlq").await.unwrap().unwrap();
        assert_eq!(dead.message.job_type, DEAD_LETTER_JOB_TYPE);
        let stored = DeadLetterRecord::from_message(&dead.message).unwrap();
        assert_eq!(stored.message.id, original.id);
        assert_eq!(stored.source_queue, "jobs");
        assert!(broker.receive_message("jobs.dlq").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_exchanges_not_implemented() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.declare_exchange("x", ExchangeKind::Direct).await,
            Err(OrchestratorError::NotImplemented { .. })
        ));
        assert!(matches!(
            broker.count_exchanges().await,
            Err(OrchestratorError::NotImplemented { .. })
        ));
        assert!(matches!(
            broker
                .declare_queue("q", &QueueOptions::bound_to("x", "rk"))
                .await,
            Err(OrchestratorError::NotImplemented { .. })
        ));
    }
}
