use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use orchestrator_core::{
    config::ConsumerConfig, DeadLetterRecord, Delivery, ExchangeKind, JobHandler, JobMessage,
    JobPayload, OrchestratorError, OrchestratorResult, QueueBroker, QueueDescriptor, QueueOptions,
};
use orchestrator_infrastructure::InMemoryBroker;
use orchestrator_worker::{Consumer, FailingWorker, ProcessOutcome, SchemaRegistry};
use serde::{Deserialize, Serialize};
use serde_json::json;

/// 记录调用次数，按配置决定成功或失败
struct CountingHandler {
    calls: AtomicU32,
    fail_with: Option<String>,
}

impl CountingHandler {
    fn succeeding() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: None,
        })
    }

    fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            fail_with: Some(message.to_string()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobHandler for CountingHandler {
    async fn run(&self, job: &JobMessage) -> anyhow::Result<serde_json::Value> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match &self.fail_with {
            Some(message) => Err(anyhow::anyhow!("{message}")),
            None => Ok(job.payload.clone()),
        }
    }
}

async fn declared_broker(queue: &str) -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    broker
        .declare_queue(queue, &QueueOptions::default())
        .await
        .unwrap();
    broker
}

#[tokio::test]
async fn test_success_acks_once() {
    let broker = declared_broker("jobs").await;
    broker
        .publish("jobs", &JobMessage::new("echo", json!({"n": 1}), 3))
        .await
        .unwrap();

    let handler = CountingHandler::succeeding();
    let mut consumer = Consumer::new(broker.clone(), "jobs", ConsumerConfig::default());
    consumer.set_run_method(handler.clone());

    let stats = consumer.consume(Some(1)).await.unwrap();
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.requeued, 0);
    assert_eq!(handler.calls(), 1);
    assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 0);
    assert!(broker.receive_message("jobs").await.unwrap().is_none());
}

#[tokio::test]
async fn test_exhausted_retries_end_in_single_dlq_copy() {
    let max_retries = 2;
    let broker = declared_broker("jobs").await;
    let original = JobMessage::new("resize", json!({"image": "a.png", "width": 640}), max_retries);
    broker.publish("jobs", &original).await.unwrap();

    let handler = CountingHandler::failing("ValueError: boom");
    let mut consumer = Consumer::new(broker.clone(), "jobs", ConsumerConfig::default());
    consumer.set_run_method(handler.clone());

    let stats = consumer.consume(Some(10)).await.unwrap();
    assert_eq!(handler.calls(), max_retries + 1);
    assert_eq!(stats.requeued, max_retries as u64);
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 0);
    assert_eq!(broker.count_queue_messages("jobs.dlq").await.unwrap(), 1);

    let dead = broker.receive_message("jobs.dlq").await.unwrap().unwrap();
    let record = DeadLetterRecord::from_message(&dead.message).unwrap();
    assert!(record.error_details.contains("ValueError: boom"));
    assert_eq!(record.source_queue, "jobs");
    assert_eq!(record.message.correlation_id, original.correlation_id);
    assert_eq!(
        serde_json::to_vec(&record.message.payload).unwrap(),
        serde_json::to_vec(&original.payload).unwrap()
    );
}

#[tokio::test]
async fn test_requeue_preserves_identity_and_increments_retry() {
    let broker = declared_broker("jobs").await;
    let original = JobMessage::new("echo", json!({"n": 1}), 3);
    broker.publish("jobs", &original).await.unwrap();

    let mut consumer = Consumer::new(broker.clone(), "jobs", ConsumerConfig::default());
    consumer.set_run_method(CountingHandler::failing("transient"));

    let delivery = broker.receive_message("jobs").await.unwrap().unwrap();
    let outcome = consumer.process_message(delivery).await.unwrap();
    assert_eq!(outcome, ProcessOutcome::Requeued);

    let again = broker.receive_message("jobs").await.unwrap().unwrap();
    assert_eq!(again.message.id, original.id);
    assert_eq!(again.message.correlation_id, original.correlation_id);
    assert_eq!(again.message.retry_count, 1);
    assert_eq!(broker.count_queue_messages("jobs").await.unwrap(), 1);
}

#[tokio::test]
async fn test_flaky_worker_succeeds_after_retry() {
    let broker = declared_broker("jobs").await;
    broker
        .publish("jobs", &JobMessage::new("flaky", json!({}), 3))
        .await
        .unwrap();

    let mut consumer = Consumer::new(broker.clone(), "jobs", ConsumerConfig::default());
    consumer.set_run_method(FailingWorker::build(&json!({"fail_times": 2})).unwrap());

    let stats = consumer.consume(Some(5)).await.unwrap();
    assert_eq!(stats.requeued, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.dead_lettered, 0);
}

#[derive(Debug, Serialize, Deserialize)]
struct Thumbnail {
    image: String,
}

impl JobPayload for Thumbnail {
    const JOB_TYPE: &'static str = "thumbnail";
}

#[tokio::test]
async fn test_schema_violation_goes_straight_to_dlq() {
    let broker = declared_broker("thumbs").await;
    broker
        .publish("thumbs", &JobMessage::new("thumbnail", json!({"path": "a.png"}), 5))
        .await
        .unwrap();

    let handler = CountingHandler::succeeding();
    let mut consumer = Consumer::new(broker.clone(), "thumbs", ConsumerConfig::default())
        .with_schemas(Arc::new(SchemaRegistry::new().with::<Thumbnail>()));
    consumer.set_run_method(handler.clone());

    let stats = consumer.consume(Some(1)).await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(handler.calls(), 0);
    assert_eq!(broker.count_queue_messages("thumbs.dlq").await.unwrap(), 1);
}

#[tokio::test]
async fn test_custom_dlq_suffix() {
    let broker = declared_broker("jobs").await;
    broker
        .publish("jobs", &JobMessage::new("echo", json!({}), 0))
        .await
        .unwrap();

    let config = ConsumerConfig {
        dlq_suffix: "-failed".to_string(),
        ..Default::default()
    };
    let mut consumer = Consumer::new(broker.clone(), "jobs", config);
    consumer.set_run_method(CountingHandler::failing("nope"));

    let stats = consumer.consume(Some(1)).await.unwrap();
    assert_eq!(stats.dead_lettered, 1);
    assert_eq!(broker.count_queue_messages("jobs-failed").await.unwrap(), 1);
}

/// 死信队列不可写的代理，其余操作委托给内存代理
struct DlqUnavailable(Arc<InMemoryBroker>);

#[async_trait]
impl QueueBroker for DlqUnavailable {
    fn backend_name(&self) -> &'static str {
        "dlq-unavailable"
    }

    async fn declare_queue(&self, queue: &str, options: &QueueOptions) -> OrchestratorResult<QueueDescriptor> {
        self.0.declare_queue(queue, options).await
    }

    async fn publish(&self, queue: &str, message: &JobMessage) -> OrchestratorResult<String> {
        self.0.publish(queue, message).await
    }

    async fn receive_message(&self, queue: &str) -> OrchestratorResult<Option<Delivery>> {
        self.0.receive_message(queue).await
    }

    async fn ack(&self, delivery: &Delivery) -> OrchestratorResult<()> {
        self.0.ack(delivery).await
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> OrchestratorResult<()> {
        self.0.nack(delivery, requeue).await
    }

    async fn clean_queue(&self, queue: &str) -> OrchestratorResult<()> {
        self.0.clean_queue(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> OrchestratorResult<()> {
        self.0.delete_queue(queue).await
    }

    async fn count_queue_messages(&self, queue: &str) -> OrchestratorResult<u64> {
        self.0.count_queue_messages(queue).await
    }

    async fn move_to_dlq(
        &self,
        _source_queue: &str,
        dlq_name: &str,
        _delivery: &Delivery,
        _error_details: &str,
    ) -> OrchestratorResult<DeadLetterRecord> {
        Err(OrchestratorError::BrokerUnavailable(format!("{dlq_name} 不可写")))
    }

    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> OrchestratorResult<()> {
        self.0.declare_exchange(exchange, kind).await
    }

    async fn delete_exchange(&self, exchange: &str) -> OrchestratorResult<()> {
        self.0.delete_exchange(exchange).await
    }

    async fn count_exchanges(&self) -> OrchestratorResult<u64> {
        self.0.count_exchanges().await
    }
}

#[tokio::test]
async fn test_failed_dead_letter_returns_message_to_source_queue() {
    let inner = declared_broker("jobs").await;
    let original = JobMessage::new("echo", json!({}), 0);
    inner.publish("jobs", &original).await.unwrap();

    let broker: Arc<dyn QueueBroker> = Arc::new(DlqUnavailable(inner.clone()));
    let mut consumer = Consumer::new(broker, "jobs", ConsumerConfig::default());
    consumer.set_run_method(CountingHandler::failing("nope"));

    let err = consumer.consume(Some(1)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::BrokerUnavailable(_)));

    let delivery = inner.receive_message("jobs").await.unwrap().unwrap();
    assert_eq!(delivery.message.id, original.id);
    assert_eq!(delivery.message.retry_count, 0);
}
