use async_trait::async_trait;

use crate::models::JobMessage;

/// 作业处理入口
///
/// Worker实现只需提供 `run`，构造参数由 WorkerRegistry 中的工厂函数解析。
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, job: &JobMessage) -> anyhow::Result<serde_json::Value>;
}
