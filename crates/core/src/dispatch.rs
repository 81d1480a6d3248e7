use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::errors::OrchestratorResult;

/// 后台任务分发器
///
/// 有后台池时任务被派发到 tokio 运行时并受并发上限约束，否则在调用方内联执行。
/// 节点代理用它上报崩溃，上报失败只记录日志，不影响调用方。
#[derive(Clone)]
pub struct BackgroundDispatcher {
    pool: Option<Arc<Semaphore>>,
}

impl BackgroundDispatcher {
    /// 带并发上限的后台池
    pub fn pool(max_concurrency: usize) -> Self {
        Self {
            pool: Some(Arc::new(Semaphore::new(max_concurrency.max(1)))),
        }
    }

    /// 无后台池，任务在调用方内联执行
    pub fn inline() -> Self {
        Self { pool: None }
    }

    pub fn is_background(&self) -> bool {
        self.pool.is_some()
    }

    pub async fn dispatch<F>(&self, task_name: &'static str, task: F)
    where
        F: Future<Output = OrchestratorResult<()>> + Send + 'static,
    {
        match &self.pool {
            Some(pool) => {
                let pool = Arc::clone(pool);
                tokio::spawn(async move {
                    let Ok(_permit) = pool.acquire_owned().await else {
                        warn!("后台池已关闭，丢弃任务: {}", task_name);
                        return;
                    };
                    run_logged(task_name, task).await;
                });
            }
            None => run_logged(task_name, task).await,
        }
    }
}

impl Default for BackgroundDispatcher {
    fn default() -> Self {
        Self::pool(16)
    }
}

async fn run_logged<F>(task_name: &'static str, task: F)
where
    F: Future<Output = OrchestratorResult<()>>,
{
    match task.await {
        Ok(()) => debug!("后台任务完成: {}", task_name),
        Err(e) => warn!("后台任务失败: {} - {}", task_name, e),
    }
}
