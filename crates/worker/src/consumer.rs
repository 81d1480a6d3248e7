//! 消费端
//!
//! 拉取 → 执行 → 确认；失败时递增重试次数重新发布，超出上限后转入死信队列。
//! 至少一次投递：同一消息可能被处理多次，处理函数需自行保证幂等。
//! 重新入队或转入死信失败时投递被退回源队列；处理中途被取消的投递同样退回。

use std::sync::Arc;

use orchestrator_core::{
    config::ConsumerConfig, dead_letter_queue_name, Delivery, JobHandler, OrchestratorError,
    OrchestratorResult, QueueBroker, QueueOptions,
};
use tokio::sync::broadcast::{self, error::TryRecvError};
use tracing::{debug, error, info, warn};

use crate::{retry_policy::RetryPolicy, schema::SchemaRegistry};

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Acked,
    Requeued,
    DeadLettered,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub acked: u64,
    pub requeued: u64,
    pub dead_lettered: u64,
}

impl ConsumeStats {
    pub fn record(&mut self, outcome: ProcessOutcome) {
        match outcome {
            ProcessOutcome::Acked => self.acked += 1,
            ProcessOutcome::Requeued => self.requeued += 1,
            ProcessOutcome::DeadLettered => self.dead_lettered += 1,
        }
    }

    pub fn processed(&self) -> u64 {
        self.acked + self.requeued + self.dead_lettered
    }
}

pub struct Consumer {
    broker: Arc<dyn QueueBroker>,
    queue: String,
    dlq_name: String,
    config: ConsumerConfig,
    schemas: Arc<SchemaRegistry>,
    handler: Option<Arc<dyn JobHandler>>,
}

impl Consumer {
    pub fn new(broker: Arc<dyn QueueBroker>, queue: impl Into<String>, config: ConsumerConfig) -> Self {
        let queue = queue.into();
        let dlq_name = dead_letter_queue_name(&queue, &config.dlq_suffix);
        Self {
            broker,
            queue,
            dlq_name,
            config,
            schemas: Arc::new(SchemaRegistry::new()),
            handler: None,
        }
    }

    pub fn with_schemas(mut self, schemas: Arc<SchemaRegistry>) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn with_dlq_name(mut self, dlq_name: impl Into<String>) -> Self {
        self.dlq_name = dlq_name.into();
        self
    }

    pub fn set_run_method(&mut self, handler: Arc<dyn JobHandler>) {
        self.handler = Some(handler);
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn dlq_name(&self) -> &str {
        &self.dlq_name
    }

    /// 声明源队列，幂等
    pub async fn declare_source_queue(&self, options: &QueueOptions) -> OrchestratorResult<()> {
        self.broker.declare_queue(&self.queue, options).await?;
        Ok(())
    }

    fn handler(&self) -> OrchestratorResult<Arc<dyn JobHandler>> {
        self.handler.clone().ok_or_else(|| {
            OrchestratorError::Configuration(format!("队列 {} 的消费者未设置处理函数", self.queue))
        })
    }

    /// 消费消息
    ///
    /// `Some(n)`：最多处理n条，队列为空时提前返回，代理错误直接向上传递。
    /// `None`：持续消费，空队列按退避间隔等待，代理错误记录后退避重试，不会返回。
    pub async fn consume(&self, max_messages: Option<usize>) -> OrchestratorResult<ConsumeStats> {
        let handler = self.handler()?;
        match max_messages {
            Some(limit) => self.consume_bounded(&handler, limit).await,
            None => self.consume_loop(&handler, None).await,
        }
    }

    /// 持续消费直到收到关闭信号，当前消息处理完成后才退出
    pub async fn run_until_shutdown(
        &self,
        shutdown: broadcast::Receiver<()>,
    ) -> OrchestratorResult<ConsumeStats> {
        let handler = self.handler()?;
        self.consume_loop(&handler, Some(shutdown)).await
    }

    async fn consume_bounded(
        &self,
        handler: &Arc<dyn JobHandler>,
        limit: usize,
    ) -> OrchestratorResult<ConsumeStats> {
        let mut stats = ConsumeStats::default();
        while (stats.processed() as usize) < limit {
            let Some(delivery) = self.broker.receive_message(&self.queue).await? else {
                debug!("队列 {} 已空，提前结束消费", self.queue);
                break;
            };
            let outcome = self.process_with(handler, delivery).await?;
            stats.record(outcome);
        }
        Ok(stats)
    }

    async fn consume_loop(
        &self,
        handler: &Arc<dyn JobHandler>,
        mut shutdown: Option<broadcast::Receiver<()>>,
    ) -> OrchestratorResult<ConsumeStats> {
        let mut stats = ConsumeStats::default();
        let mut backoff = RetryPolicy::from_config(&self.config);
        info!("开始消费队列: {}", self.queue);

        loop {
            if let Some(rx) = shutdown.as_mut() {
                match rx.try_recv() {
                    Err(TryRecvError::Empty) => {}
                    _ => break,
                }
            }

            let step = match self.broker.receive_message(&self.queue).await {
                Ok(Some(delivery)) => self.process_with(handler, delivery).await.map(Some),
                Ok(None) => Ok(None),
                Err(e) => Err(e),
            };

            match step {
                Ok(Some(outcome)) => {
                    stats.record(outcome);
                    backoff.reset();
                    continue;
                }
                Ok(None) => {}
                Err(e) => warn!("消费队列 {} 出错: {}", self.queue, e),
            }

            let delay = backoff.next_delay();
            let stopped = match shutdown.as_mut() {
                Some(rx) => tokio::select! {
                    _ = rx.recv() => true,
                    _ = tokio::time::sleep(delay) => false,
                },
                None => {
                    tokio::time::sleep(delay).await;
                    false
                }
            };
            if stopped {
                break;
            }
        }

        info!(
            "停止消费队列 {}: acked={}, requeued={}, dead_lettered={}",
            self.queue, stats.acked, stats.requeued, stats.dead_lettered
        );
        Ok(stats)
    }

    /// 处理一条已接收的消息
    pub async fn process_message(&self, delivery: Delivery) -> OrchestratorResult<ProcessOutcome> {
        let handler = self.handler()?;
        self.process_with(&handler, delivery).await
    }

    async fn process_with(
        &self,
        handler: &Arc<dyn JobHandler>,
        delivery: Delivery,
    ) -> OrchestratorResult<ProcessOutcome> {
        let mut guard = InFlightGuard::new(Arc::clone(&self.broker), delivery.clone());
        let result = self.settle(handler, &delivery).await;
        guard.disarm();

        if let Err(e) = &result {
            warn!("消息 {} 未能进入终态，退回队列 {}: {}", delivery.message.id, self.queue, e);
            if let Err(nack_err) = self.broker.nack(&delivery, true).await {
                error!("退回消息 {} 失败: {}", delivery.message.id, nack_err);
            }
        }
        result
    }

    async fn settle(
        &self,
        handler: &Arc<dyn JobHandler>,
        delivery: &Delivery,
    ) -> OrchestratorResult<ProcessOutcome> {
        let message = &delivery.message;

        if let Err(e) = self.schemas.validate(message) {
            warn!("消息 {} 未通过校验，直接转入死信队列: {}", message.id, e);
            self.dead_letter(delivery, &e.to_string()).await?;
            return Ok(ProcessOutcome::DeadLettered);
        }

        debug!(
            "处理消息: queue={}, id={}, job_type={}, retry_count={}",
            self.queue, message.id, message.job_type, message.retry_count
        );

        match handler.run(message).await {
            Ok(_) => {
                self.broker.ack(delivery).await?;
                metrics::counter!("orchestrator_jobs_processed_total", "queue" => self.queue.clone())
                    .increment(1);
                Ok(ProcessOutcome::Acked)
            }
            Err(e) => {
                let error_details = format!("{e:#}");
                let mut retry = message.clone();
                retry.increment_retry();

                if retry.can_retry() {
                    warn!(
                        "消息 {} 处理失败，重新入队 ({}/{}): {}",
                        message.id, retry.retry_count, retry.max_retries, error_details
                    );
                    self.broker.requeue(delivery, &retry).await?;
                    metrics::counter!("orchestrator_jobs_retried_total", "queue" => self.queue.clone())
                        .increment(1);
                    Ok(ProcessOutcome::Requeued)
                } else {
                    error!(
                        "消息 {} 重试次数耗尽 ({}), 转入死信队列 {}: {}",
                        message.id, message.max_retries, self.dlq_name, error_details
                    );
                    self.dead_letter(delivery, &error_details).await?;
                    Ok(ProcessOutcome::DeadLettered)
                }
            }
        }
    }

    async fn dead_letter(&self, delivery: &Delivery, error_details: &str) -> OrchestratorResult<()> {
        let record = self
            .broker
            .move_to_dlq(&self.queue, &self.dlq_name, delivery, error_details)
            .await?;
        metrics::counter!("orchestrator_jobs_dead_lettered_total", "queue" => self.queue.clone())
            .increment(1);
        debug!("死信记录已写入: id={}, source={}", record.id, record.source_queue);
        Ok(())
    }
}

/// 处理过程被取消（所在任务被 abort）时把投递退回队列
struct InFlightGuard {
    broker: Arc<dyn QueueBroker>,
    delivery: Option<Delivery>,
}

impl InFlightGuard {
    fn new(broker: Arc<dyn QueueBroker>, delivery: Delivery) -> Self {
        Self {
            broker,
            delivery: Some(delivery),
        }
    }

    fn disarm(&mut self) {
        self.delivery = None;
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let Some(delivery) = self.delivery.take() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("运行时已关闭，消息 {} 留待代理重新投递", delivery.message.id);
            return;
        };
        let broker = Arc::clone(&self.broker);
        runtime.spawn(async move {
            match broker.nack(&delivery, true).await {
                Ok(()) => debug!("已退回被取消处理的消息 {}", delivery.message.id),
                Err(e) => warn!("退回被取消处理的消息 {} 失败: {}", delivery.message.id, e),
            }
        });
    }
}
