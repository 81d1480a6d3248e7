use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use orchestrator_core::{
    config::ConsumerConfig, JobHandler, JobMessage, OrchestratorError, OrchestratorResult,
    QueueBroker, QueueOptions,
};
use serde_json::json;
use tokio::{net::TcpListener, sync::broadcast};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::{consumer::Consumer, schema::SchemaRegistry};

#[derive(Clone)]
struct WorkerState {
    worker_name: Arc<str>,
    job_type: Arc<str>,
    handler: Arc<dyn JobHandler>,
    jobs_run: Arc<AtomicU64>,
}

/// 单个Worker进程的HTTP入口，可选地附带队列消费循环
pub struct WorkerServer {
    worker_name: String,
    job_type: String,
    handler: Arc<dyn JobHandler>,
    consumer: Option<Consumer>,
}

impl WorkerServer {
    pub fn new(
        worker_name: impl Into<String>,
        job_type: impl Into<String>,
        handler: Arc<dyn JobHandler>,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            job_type: job_type.into(),
            handler,
            consumer: None,
        }
    }

    /// 消费以作业类型命名的队列
    pub fn with_consumer(
        mut self,
        broker: Arc<dyn QueueBroker>,
        config: ConsumerConfig,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        let mut consumer = Consumer::new(broker, self.job_type.clone(), config).with_schemas(schemas);
        consumer.set_run_method(Arc::clone(&self.handler));
        self.consumer = Some(consumer);
        self
    }

    pub fn worker_name(&self) -> &str {
        &self.worker_name
    }

    pub fn router(&self) -> Router {
        let state = WorkerState {
            worker_name: Arc::from(self.worker_name.as_str()),
            job_type: Arc::from(self.job_type.as_str()),
            handler: Arc::clone(&self.handler),
            jobs_run: Arc::new(AtomicU64::new(0)),
        };
        Router::new()
            .route("/health", get(health))
            .route("/run", post(run_job))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    pub async fn bind(addr: &str) -> OrchestratorResult<TcpListener> {
        TcpListener::bind(addr)
            .await
            .map_err(|e| OrchestratorError::WorkerLaunch(format!("绑定地址 {addr} 失败: {e}")))
    }

    /// 运行直到收到关闭信号；消费循环在当前消息处理完后退出
    pub async fn serve(
        self,
        listener: TcpListener,
        shutdown: broadcast::Receiver<()>,
    ) -> OrchestratorResult<()> {
        let router = self.router();
        let addr = listener
            .local_addr()
            .map_err(|e| OrchestratorError::Internal(e.to_string()))?;

        let consumer_task = match self.consumer {
            Some(consumer) => {
                consumer
                    .declare_source_queue(&QueueOptions::default())
                    .await?;
                let consumer_shutdown = shutdown.resubscribe();
                Some(tokio::spawn(async move {
                    consumer.run_until_shutdown(consumer_shutdown).await
                }))
            }
            None => None,
        };

        info!(
            "Worker {} 已启动: addr={}, job_type={}",
            self.worker_name, addr, self.job_type
        );
        let mut server_shutdown = shutdown;
        axum::serve(listener, router)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.recv().await;
            })
            .await
            .map_err(|e| OrchestratorError::Network(format!("Worker HTTP服务异常退出: {e}")))?;

        if let Some(task) = consumer_task {
            let stats = task
                .await
                .map_err(|e| OrchestratorError::Internal(format!("消费任务异常结束: {e}")))??;
            info!(
                "Worker {} 消费统计: acked={}, requeued={}, dead_lettered={}",
                self.worker_name, stats.acked, stats.requeued, stats.dead_lettered
            );
        }
        info!("Worker {} 已停止", self.worker_name);
        Ok(())
    }
}

async fn health(State(state): State<WorkerState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "worker_name": state.worker_name.as_ref(),
        "job_type": state.job_type.as_ref(),
        "jobs_run": state.jobs_run.load(Ordering::Relaxed),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn run_job(State(state): State<WorkerState>, Json(job): Json<JobMessage>) -> Response {
    if let Err(e) = job.validate() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": e.to_string()})),
        )
            .into_response();
    }
    if job.job_type != state.job_type.as_ref() {
        let message = format!(
            "Worker {} 只处理 {} 作业，收到 {}",
            state.worker_name, state.job_type, job.job_type
        );
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({"success": false, "error": message})),
        )
            .into_response();
    }

    state.jobs_run.fetch_add(1, Ordering::Relaxed);
    match state.handler.run(&job).await {
        Ok(data) => Json(json!({"success": true, "data": data})).into_response(),
        Err(e) => {
            error!("作业 {} 执行失败: {:#}", job.id, e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"success": false, "error": format!("{e:#}")})),
            )
                .into_response()
        }
    }
}
