//! Redis Streams 队列代理
//!
//! 每个队列是一个 Stream，配一个消费组。已声明的队列登记在
//! `{group}:queues` 集合中，发布前据此判断队列是否存在。
//! 确认 = `XACK` + `XDEL`，因此 `XLEN` 统计包含已投递未确认的条目。
//! 无法解析的条目与原始内容一起写入 `{queue}{dlq_suffix}`。

use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use orchestrator_core::{
    dead_letter_queue_name, DeadLetterRecord, Delivery, ExchangeKind, JobMessage,
    OrchestratorError, OrchestratorResult, QueueBroker, QueueDescriptor, QueueOptions,
    DEFAULT_DLQ_SUFFIX,
};
use redis::{
    aio::ConnectionManager,
    streams::{StreamAutoClaimReply, StreamId, StreamReadReply},
    AsyncCommands,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::connection::{redis_error, RedisConnection};

const BACKEND: &str = "redis_stream";
const DATA_FIELD: &str = "data";
const MESSAGE_ID_FIELD: &str = "message_id";
/// 超过该时长仍未确认的条目会被重新认领
const DEFAULT_CLAIM_IDLE_MS: u64 = 300_000;

pub struct RedisStreamBroker {
    connection: Arc<RedisConnection>,
    group: String,
    consumer_id: String,
    claim_idle_ms: u64,
    dlq_suffix: String,
}

impl RedisStreamBroker {
    pub fn new(connection: Arc<RedisConnection>, group: impl Into<String>) -> Self {
        let group = group.into();
        let consumer_id = format!("{}-{}", group, Uuid::new_v4());
        info!("创建Redis Streams代理，消费组: {}，消费者: {}", group, consumer_id);
        Self {
            connection,
            group,
            consumer_id,
            claim_idle_ms: DEFAULT_CLAIM_IDLE_MS,
            dlq_suffix: DEFAULT_DLQ_SUFFIX.to_string(),
        }
    }

    /// 无法解析的条目写入 `{queue}{dlq_suffix}`
    pub fn with_dlq_suffix(mut self, dlq_suffix: impl Into<String>) -> Self {
        self.dlq_suffix = dlq_suffix.into();
        self
    }

    /// 设置未确认条目被重新认领前的空闲时长
    pub fn with_claim_idle_ms(mut self, claim_idle_ms: u64) -> Self {
        self.claim_idle_ms = claim_idle_ms;
        self
    }

    fn registry_key(&self) -> String {
        format!("{}:queues", self.group)
    }

    fn session(&self) -> OrchestratorResult<ConnectionManager> {
        self.connection.session()
    }

    async fn is_declared(&self, conn: &mut ConnectionManager, queue: &str) -> OrchestratorResult<bool> {
        conn.sismember(self.registry_key(), queue)
            .await
            .map_err(|e| redis_error("查询队列登记失败", e))
    }

    async fn require_declared(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
    ) -> OrchestratorResult<()> {
        if self.is_declared(conn, queue).await? {
            Ok(())
        } else {
            Err(OrchestratorError::QueueNotFound {
                queue: queue.to_string(),
            })
        }
    }

    async fn ensure_group(&self, conn: &mut ConnectionManager, queue: &str) -> OrchestratorResult<()> {
        let created: redis::RedisResult<String> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(queue)
            .arg(&self.group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match created {
            Ok(_) => {
                debug!("为队列 {} 创建消费组 {}", queue, self.group);
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!("消费组 {} 已存在", self.group);
                Ok(())
            }
            Err(e) => Err(redis_error(&format!("创建消费组 {} 失败", self.group), e)),
        }
    }

    async fn declare(&self, conn: &mut ConnectionManager, queue: &str) -> OrchestratorResult<u64> {
        self.ensure_group(conn, queue).await?;
        let _: i64 = conn
            .sadd(self.registry_key(), queue)
            .await
            .map_err(|e| redis_error("登记队列失败", e))?;
        conn.xlen(queue)
            .await
            .map_err(|e| redis_error(&format!("获取队列 {queue} 长度失败"), e))
    }

    fn entry_to_delivery(queue: &str, entry: &StreamId) -> OrchestratorResult<Delivery> {
        let data: String = entry.get(DATA_FIELD).ok_or_else(|| {
            OrchestratorError::Serialization(format!("Stream条目 {} 缺少消息体", entry.id))
        })?;
        let message: JobMessage = serde_json::from_str(&data)
            .map_err(|e| OrchestratorError::Serialization(format!("反序列化消息失败: {e}")))?;
        Ok(Delivery::new(queue, entry.id.clone(), message))
    }

    fn encode(message: &JobMessage) -> OrchestratorResult<String> {
        serde_json::to_string(message)
            .map_err(|e| OrchestratorError::Serialization(format!("序列化消息失败: {e}")))
    }

    /// 无法解析的条目连同原始内容写入死信队列，与移除原条目在同一事务内完成
    async fn dead_letter_raw(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
        entry: &StreamId,
        error: &OrchestratorError,
    ) -> OrchestratorResult<()> {
        let dlq_name = dead_letter_queue_name(queue, &self.dlq_suffix);
        self.declare(conn, &dlq_name).await?;

        let raw: String = entry.get(DATA_FIELD).unwrap_or_default();
        let record = DeadLetterRecord::unparseable(queue, raw.as_bytes(), error.to_string());
        let dead_letter = record.to_message()?;
        let data = Self::encode(&dead_letter)?;

        let _: (String, i64, i64) = redis::pipe()
            .atomic()
            .xadd(
                &dlq_name,
                "*",
                &[(MESSAGE_ID_FIELD, dead_letter.id.as_str()), (DATA_FIELD, data.as_str())],
            )
            .xack(queue, &self.group, &[&entry.id])
            .xdel(queue, &[&entry.id])
            .query_async(conn)
            .await
            .map_err(|e| redis_error("无法解析的条目转入死信队列失败", e))?;

        warn!(
            "队列 {} 中的条目 {} 无法解析，已转入死信队列 {}: {}",
            queue, entry.id, dlq_name, error
        );
        Ok(())
    }

    /// 认领其他消费者遗留的超时未确认条目
    async fn claim_stale(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
    ) -> OrchestratorResult<Option<StreamId>> {
        let reply: redis::RedisResult<StreamAutoClaimReply> = redis::cmd("XAUTOCLAIM")
            .arg(queue)
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg(self.claim_idle_ms)
            .arg("0-0")
            .arg("COUNT")
            .arg(1)
            .query_async(conn)
            .await;

        match reply {
            Ok(reply) => Ok(reply.claimed.into_iter().next()),
            Err(e) if e.to_string().contains("NOGROUP") => Err(OrchestratorError::QueueNotFound {
                queue: queue.to_string(),
            }),
            Err(e) => Err(redis_error(&format!("认领队列 {queue} 的遗留消息失败"), e)),
        }
    }

    async fn read_new(
        &self,
        conn: &mut ConnectionManager,
        queue: &str,
    ) -> OrchestratorResult<Option<StreamId>> {
        let reply: redis::RedisResult<Option<StreamReadReply>> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(&self.group)
            .arg(&self.consumer_id)
            .arg("COUNT")
            .arg(1)
            .arg("STREAMS")
            .arg(queue)
            .arg(">")
            .query_async(conn)
            .await;

        match reply {
            Ok(reply) => Ok(reply
                .and_then(|r| r.keys.into_iter().next())
                .and_then(|key| key.ids.into_iter().next())),
            Err(e) if e.to_string().contains("NOGROUP") => Err(OrchestratorError::QueueNotFound {
                queue: queue.to_string(),
            }),
            Err(e) => Err(redis_error(&format!("从队列 {queue} 读取消息失败"), e)),
        }
    }

    fn not_implemented(operation: &'static str) -> OrchestratorError {
        OrchestratorError::NotImplemented {
            backend: BACKEND,
            operation,
        }
    }
}

#[async_trait]
impl QueueBroker for RedisStreamBroker {
    fn backend_name(&self) -> &'static str {
        BACKEND
    }

    async fn declare_queue(
        &self,
        queue: &str,
        options: &QueueOptions,
    ) -> OrchestratorResult<QueueDescriptor> {
        if options.exchange.is_some() {
            return Err(Self::not_implemented("declare_queue_with_exchange"));
        }
        let mut conn = self.session()?;
        let message_count = self.declare(&mut conn, queue).await?;

        debug!("队列 {} 声明成功", queue);
        Ok(QueueDescriptor {
            name: queue.to_string(),
            exchange: None,
            durable: true,
            message_count,
        })
    }

    async fn publish(&self, queue: &str, message: &JobMessage) -> OrchestratorResult<String> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, queue).await?;

        let data = Self::encode(message)?;
        let entry_id: String = conn
            .xadd(
                queue,
                "*",
                &[(MESSAGE_ID_FIELD, message.id.as_str()), (DATA_FIELD, data.as_str())],
            )
            .await
            .map_err(|e| match redis_error("发布消息失败", e) {
                OrchestratorError::Internal(msg) => OrchestratorError::Publish(msg),
                other => other,
            })?;

        counter!("orchestrator_broker_published_total", "backend" => BACKEND).increment(1);
        debug!(
            "消息 {} 已发布到Stream {}，条目ID: {}",
            message.id, queue, entry_id
        );
        Ok(message.id.clone())
    }

    async fn receive_message(&self, queue: &str) -> OrchestratorResult<Option<Delivery>> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, queue).await?;

        loop {
            let entry = match self.claim_stale(&mut conn, queue).await? {
                Some(entry) => {
                    warn!("重新认领队列 {} 中超时未确认的条目 {}", queue, entry.id);
                    Some(entry)
                }
                None => self.read_new(&mut conn, queue).await?,
            };

            let Some(entry) = entry else {
                return Ok(None);
            };

            match Self::entry_to_delivery(queue, &entry) {
                Ok(delivery) => return Ok(Some(delivery)),
                Err(e) => self.dead_letter_raw(&mut conn, queue, &entry, &e).await?,
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) -> OrchestratorResult<()> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, &delivery.queue).await?;

        let (acked, _deleted): (i64, i64) = redis::pipe()
            .atomic()
            .xack(&delivery.queue, &self.group, &[&delivery.receipt])
            .xdel(&delivery.queue, &[&delivery.receipt])
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("确认消息失败", e))?;

        if acked == 0 {
            return Err(OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, delivery.queue
            )));
        }
        debug!("消息 {} 已确认", delivery.message.id);
        Ok(())
    }

    /// 退回时重新追加到 Stream 尾部；连接失败时条目仍在待确认列表中，由 XAUTOCLAIM 兜底
    async fn nack(&self, delivery: &Delivery, requeue: bool) -> OrchestratorResult<()> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, &delivery.queue).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        if requeue {
            let data = Self::encode(&delivery.message)?;
            pipe.xadd(
                &delivery.queue,
                "*",
                &[(MESSAGE_ID_FIELD, delivery.message.id.as_str()), (DATA_FIELD, data.as_str())],
            )
            .ignore();
        }
        pipe.xack(&delivery.queue, &self.group, &[&delivery.receipt])
            .xdel(&delivery.queue, &[&delivery.receipt])
            .ignore();

        let (acked,): (i64,) = pipe
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("退回消息失败", e))?;
        if acked == 0 {
            return Err(OrchestratorError::Validation(format!(
                "投递 {} 已确认或不存在于队列 {}",
                delivery.receipt, delivery.queue
            )));
        }

        if requeue {
            debug!("消息 {} 已退回队列 {}", delivery.message.id, delivery.queue);
        } else {
            warn!("消息 {} 被拒绝并丢弃 (队列 {})", delivery.message.id, delivery.queue);
        }
        Ok(())
    }

    async fn requeue(&self, delivery: &Delivery, message: &JobMessage) -> OrchestratorResult<String> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, &delivery.queue).await?;
        let data = Self::encode(message)?;

        // 写入新副本与移除原条目在同一个事务内完成
        let (_entry_id, acked, _deleted): (String, i64, i64) = redis::pipe()
            .atomic()
            .xadd(
                &delivery.queue,
                "*",
                &[(MESSAGE_ID_FIELD, message.id.as_str()), (DATA_FIELD, data.as_str())],
            )
            .xack(&delivery.queue, &self.group, &[&delivery.receipt])
            .xdel(&delivery.queue, &[&delivery.receipt])
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("消息重新入队失败", e))?;

        if acked == 0 {
            warn!(
                "重新入队时原条目 {} 已不在待确认列表中，消息可能重复",
                delivery.receipt
            );
        }
        counter!("orchestrator_broker_published_total", "backend" => BACKEND).increment(1);
        Ok(message.id.clone())
    }

    async fn clean_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, queue).await?;

        let removed: u64 = conn
            .xlen(queue)
            .await
            .map_err(|e| redis_error(&format!("获取队列 {queue} 长度失败"), e))?;
        let _: i64 = conn
            .del(queue)
            .await
            .map_err(|e| redis_error(&format!("清空队列 {queue} 失败"), e))?;
        self.ensure_group(&mut conn, queue).await?;

        info!("队列 {} 已清空，移除 {} 条消息", queue, removed);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> OrchestratorResult<()> {
        let mut conn = self.session()?;
        let (_removed, deleted): (i64, i64) = redis::pipe()
            .atomic()
            .srem(self.registry_key(), queue)
            .del(queue)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error(&format!("删除队列 {queue} 失败"), e))?;

        if deleted > 0 {
            info!("队列 {} 已删除", queue);
        } else {
            debug!("队列 {} 不存在，忽略删除", queue);
        }
        Ok(())
    }

    async fn count_queue_messages(&self, queue: &str) -> OrchestratorResult<u64> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, queue).await?;
        conn.xlen(queue)
            .await
            .map_err(|e| redis_error(&format!("获取队列 {queue} 长度失败"), e))
    }

    async fn move_to_dlq(
        &self,
        source_queue: &str,
        dlq_name: &str,
        delivery: &Delivery,
        error_details: &str,
    ) -> OrchestratorResult<DeadLetterRecord> {
        let mut conn = self.session()?;
        self.require_declared(&mut conn, source_queue).await?;
        self.declare(&mut conn, dlq_name).await?;

        let record = DeadLetterRecord::new(source_queue, delivery.message.clone(), error_details);
        let dead_letter = record.to_message()?;
        let data = Self::encode(&dead_letter)?;

        // 写入死信与移除原条目在同一个事务内完成
        let (_dead_id, acked, _deleted): (String, i64, i64) = redis::pipe()
            .atomic()
            .xadd(
                dlq_name,
                "*",
                &[(MESSAGE_ID_FIELD, dead_letter.id.as_str()), (DATA_FIELD, data.as_str())],
            )
            .xack(source_queue, &self.group, &[&delivery.receipt])
            .xdel(source_queue, &[&delivery.receipt])
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_error("转入死信队列失败", e))?;

        if acked == 0 {
            warn!(
                "死信转移时原条目 {} 已不在待确认列表中，死信可能重复",
                delivery.receipt
            );
        }

        info!(
            "消息 {} 已从 {} 转入死信队列 {}",
            delivery.message.id, source_queue, dlq_name
        );
        Ok(record)
    }

    async fn declare_exchange(&self, _exchange: &str, _kind: ExchangeKind) -> OrchestratorResult<()> {
        Err(Self::not_implemented("declare_exchange"))
    }

    async fn delete_exchange(&self, _exchange: &str) -> OrchestratorResult<()> {
        Err(Self::not_implemented("delete_exchange"))
    }

    async fn count_exchanges(&self) -> OrchestratorResult<u64> {
        Err(Self::not_implemented("count_exchanges"))
    }
}
