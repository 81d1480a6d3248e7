use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use lapin::{
    options::*,
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel,
};
use metrics::counter;
use orchestrator_core::{
    dead_letter_queue_name, BrokerConnection, DeadLetterRecord, Delivery, ExchangeKind,
    JobMessage, OrchestratorError, OrchestratorResult, QueueBroker, QueueDescriptor, QueueOptions,
    DEFAULT_DLQ_SUFFIX,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::connection::RabbitMqConnection;

const BACKEND: &str = "rabbitmq";

/// RabbitMQ 队列代理
///
/// 所有操作共用一个开启发布确认的通道；通道被服务端关闭（如访问不存在的队列）
/// 时在下一次操作前重建，旧通道上未确认的投递随之失效。
pub struct RabbitMqBroker {
    connection: Arc<RabbitMqConnection>,
    state: Mutex<ChannelState>,
    exchanges: Mutex<HashSet<String>>,
    dlq_suffix: String,
}

struct ChannelState {
    channel: Channel,
    generation: u64,
    /// delivery tag -> 队列名
    in_flight: HashMap<u64, String>,
}

impl RabbitMqBroker {
    pub async fn new(connection: Arc<RabbitMqConnection>) -> OrchestratorResult<Self> {
        let channel = connection.create_channel().await?;
        Ok(Self {
            connection,
            state: Mutex::new(ChannelState {
                channel,
                generation: 0,
                in_flight: HashMap::new(),
            }),
            exchanges: Mutex::new(HashSet::new()),
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
        })
    }

    /// 无法解析的消息写入 `{queue}{dlq_suffix}`
    pub fn with_dlq_suffix(mut self, dlq_suffix: impl Into<String>) -> Self {
        self.dlq_suffix = dlq_suffix.into();
        self
    }

    pub fn connection(&self) -> &Arc<RabbitMqConnection> {
        &self.connection
    }

    async fn ensure_channel(&self, state: &mut ChannelState) -> OrchestratorResult<()> {
        if state.channel.status().connected() {
            return Ok(());
        }
        state.channel = self.connection.create_channel().await?;
        state.generation += 1;
        if !state.in_flight.is_empty() {
            warn!(
                "RabbitMQ通道已重建，{} 条未确认投递将由服务端重新投递",
                state.in_flight.len()
            );
        }
        state.in_flight.clear();
        Ok(())
    }

    fn map_error(&self, context: &str, queue: Option<&str>, e: lapin::Error) -> OrchestratorError {
        let text = e.to_string();
        if !self.connection.is_connected() {
            return OrchestratorError::BrokerUnavailable(format!("{context}: {text}"));
        }
        if let Some(queue) = queue {
            if text.contains("NOT_FOUND") || text.contains("404") {
                return OrchestratorError::QueueNotFound {
                    queue: queue.to_string(),
                };
            }
        }
        OrchestratorError::Internal(format!("{context}: {text}"))
    }

    fn encode_receipt(generation: u64, tag: u64) -> String {
        format!("{generation}.{tag}")
    }

    fn decode_receipt(receipt: &str) -> OrchestratorResult<(u64, u64)> {
        receipt
            .split_once('.')
            .and_then(|(g, t)| Some((g.parse().ok()?, t.parse().ok()?)))
            .ok_or_else(|| OrchestratorError::Validation(format!("无效的投递凭证: {receipt}")))
    }

    /// 校验投递仍属于当前通道并返回其 delivery tag
    fn take_in_flight(
        state: &mut ChannelState,
        queue: &str,
        delivery: &Delivery,
    ) -> OrchestratorResult<u64> {
        let (generation, tag) = Self::decode_receipt(&delivery.receipt)?;
        let known = generation == state.generation
            && state.in_flight.get(&tag).map(String::as_str) == Some(queue);
        if !known {
            return Err(OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, queue
            )));
        }
        state.in_flight.remove(&tag);
        Ok(tag)
    }

    async fn publish_confirmed(
        &self,
        channel: &Channel,
        queue: &str,
        message: &JobMessage,
    ) -> OrchestratorResult<()> {
        let payload = message.serialize_bytes()?;
        let properties = BasicProperties::default()
            .with_delivery_mode(2)
            .with_content_type("application/json".into())
            .with_message_id(message.id.clone().into())
            .with_correlation_id(message.correlation_id.to_string().into());

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                &payload,
                properties,
            )
            .await
            .map_err(|e| self.map_error("发布消息失败", Some(queue), e))?;

        let confirmation = confirm
            .await
            .map_err(|e| self.map_error("消息发布确认失败", Some(queue), e))?;

        match confirmation {
            Confirmation::Ack(Some(returned)) => {
                debug!("消息 {} 被退回: {:?}", message.id, returned.reply_text);
                Err(OrchestratorError::QueueNotFound {
                    queue: queue.to_string(),
                })
            }
            Confirmation::Nack(_) => Err(OrchestratorError::Publish(format!(
                "RabbitMQ拒绝了发往 {queue} 的消息 {}",
                message.id
            ))),
            Confirmation::Ack(None) | Confirmation::NotRequested => Ok(()),
        }
    }

    async fn declare_on(
        &self,
        channel: &Channel,
        queue: &str,
        options: &QueueOptions,
    ) -> OrchestratorResult<u64> {
        let mut arguments = FieldTable::default();
        if let Some(max_length) = options.max_length {
            arguments.insert(
                "x-max-length".into(),
                AMQPValue::LongLongInt(max_length as i64),
            );
            arguments.insert(
                "x-overflow".into(),
                AMQPValue::LongString("reject-publish".into()),
            );
        }

        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: false,
                    auto_delete: false,
                    ..Default::default()
                },
                arguments,
            )
            .await
            .map_err(|e| self.map_error(&format!("声明队列 {queue} 失败"), None, e))?;

        if let Some(exchange) = &options.exchange {
            let routing_key = options.routing_key.as_deref().unwrap_or(queue);
            channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| self.map_error(&format!("绑定队列 {queue} 到 {exchange} 失败"), None, e))?;
        }

        Ok(u64::from(declared.message_count()))
    }
}

#[async_trait]
impl QueueBroker for RabbitMqBroker {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> OrchestratorResult<QueueDescriptor> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        let message_count = self.declare_on(&state.channel, queue, options).await?;

        debug!("队列 {} 声明成功", queue);
        Ok(QueueDescriptor {
            name: queue.to_string(),
            exchange: options.exchange.clone(),
            durable: options.durable,
            message_count,
        })
    }

    async fn publish(&self, queue: &str, message: &JobMessage) -> OrchestratorResult<String> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        self.publish_confirmed(&state.channel, queue, message).await?;

        counter!("orchestrator_broker_published_total", "backend" => BACKEND).increment(1);
        debug!("消息 {} 已发布到队列: {}", message.id, queue);
        Ok(message.id.clone())
    }

    async fn receive_message(&self, queue: &str) -> OrchestratorResult<Option<Delivery>> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;

        loop {
            let fetched = state
                .channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| self.map_error(&format!("从队列 {queue} 获取消息失败"), Some(queue), e))?;

            let Some(fetched) = fetched else {
                return Ok(None);
            };
            let tag = fetched.delivery.delivery_tag;

            match JobMessage::deserialize_bytes(&fetched.delivery.data) {
                Ok(message) => {
                    state.in_flight.insert(tag, queue.to_string());
                    return Ok(Some(Delivery::new(
                        queue,
                        Self::encode_receipt(state.generation, tag),
                        message,
                    )));
                }
                Err(e) => {
                    // 死信确认写入后才拒绝原消息
                    let dlq_name = dead_letter_queue_name(queue, &self.dlq_suffix);
                    let record =
                        DeadLetterRecord::unparseable(queue, &fetched.delivery.data, e.to_string());
                    self.declare_on(&state.channel, &dlq_name, &QueueOptions::default())
                        .await?;
                    self.publish_confirmed(&state.channel, &dlq_name, &record.to_message()?)
                        .await?;
                    state
                        .channel
                        .basic_reject(tag, BasicRejectOptions { requeue: false })
                        .await
                        .map_err(|e| self.map_error("拒绝消息失败", Some(queue), e))?;
                    error!("队列 {} 中的消息无法解析，已转入死信队列 {}: {}", queue, dlq_name, e);
                }
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        let tag = Self::take_in_flight(&mut state, &delivery.queue, delivery)?;
        state
            .channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.map_error("确认消息失败", Some(&delivery.queue), e))?;

        debug!("消息 {} 已确认", delivery.message.id);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        let tag = Self::take_in_flight(&mut state, &delivery.queue, delivery)?;
        state
            .channel
            .basic_nack(
                tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await
            .map_err(|e| self.map_error("退回消息失败", Some(&delivery.queue), e))?;

        if requeue {
            debug!("消息 {} 已退回队列 {}", delivery.message.id, delivery.queue);
        } else {
            warn!("消息 {} 被拒绝并丢弃 (队列 {})", delivery.message.id, delivery.queue);
        }
        Ok(())
    }

    async fn clean_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        let purged = state
            .channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| self.map_error(&format!("清空队列 {queue} 失败"), Some(queue), e))?;

        info!("队列 {} 已清空，移除 {} 条消息", queue, purged);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        state
            .channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
            .map_err(|e| self.map_error(&format!("删除队列 {queue} 失败"), None, e))?;
        state.in_flight.retain(|_, q| q != queue);

        info!("队列 {} 已删除", queue);
        Ok(())
    }

    async fn count_queue_messages(&self, queue: &str) -> OrchestratorResult<u64> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        let info = state
            .channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(&format!("获取队列 {queue} 信息失败"), Some(queue), e))?;

        Ok(u64::from(info.message_count()))
    }

    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq_name: &str,
        delivery: &Delivery,
        error_details: &str,
    ) -> OrchestratorResult<DeadLetterRecord> {
        let mut state = self.state.lock().await;
        let (generation, tag) = Self::decode_receipt(&delivery.receipt)?;
        if generation != state.generation
            || state.in_flight.get(&tag).map(String::as_str) != Some(source_queue)
        {
            return Err(OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, source_queue
            )));
        }

        let record = DeadLetterRecord::new(source_queue, delivery.message.clone(), error_details);
        let dead_letter = record.to_message()?;

        // 先确认死信写入，再确认原消息；两步之间崩溃只会产生重复，不会丢失
        self.declare_on(&state.channel, dlq_name, &QueueOptions::default())
            .await?;
        self.publish_confirmed(&state.channel, dlq_name, &dead_letter)
            .await?;

        let tag = Self::take_in_flight(&mut state, source_queue, delivery)?;
        state
            .channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| self.map_error("确认死信原消息失败", Some(source_queue), e))?;

        info!(
            "消息 {} 已从 {} 转入死信队列 {}",
            delivery.message.id, source_queue, dlq_name
        );
        Ok(record)
    }

    async fn declare_exchange(&self, exchange: &str, kind: ExchangeKind) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        let lapin_kind = match kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        };
        state
            .channel
            .exchange_declare(
                exchange,
                lapin_kind,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_error(&format!("声明交换机 {exchange} 失败"), None, e))?;

        self.exchanges.lock().await.insert(exchange.to_string());
        debug!("交换机 {} ({}) 声明成功", exchange, kind.as_str());
        Ok(())
    }

    async fn delete_exchange(&self, exchange: &str) -> OrchestratorResult<()> {
        let mut state = self.state.lock().await;
        self.ensure_channel(&mut state).await?;
        state
            .channel
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await
            .map_err(|e| self.map_error(&format!("删除交换机 {exchange} 失败"), None, e))?;

        self.exchanges.lock().await.remove(exchange);
        debug!("交换机 {} 已删除", exchange);
        Ok(())
    }

    /// 只统计经由本代理声明的交换机
    async fn count_exchanges(&self) -> OrchestratorResult<u64> {
        Ok(self.exchanges.lock().await.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receipt_encoding() {
        let receipt = RabbitMqBroker::encode_receipt(3, 17);
        assert_eq!(receipt, "3.17");
        assert_eq!(RabbitMqBroker::decode_receipt(&receipt).unwrap(), (3, 17));
        assert!(RabbitMqBroker::decode_receipt("17").is_err());
        assert!(RabbitMqBroker::decode_receipt("a.b").is_err());
    }
}
