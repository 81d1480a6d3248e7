use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    config::ConsumerConfig, parse_worker_port, LaunchRequest, OrchestratorError,
    OrchestratorResult, QueueBroker,
};
use orchestrator_worker::{SchemaRegistry, WorkerRegistry, WorkerServer};
use tokio::process::{Child, Command};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 已启动的Worker
#[async_trait]
pub trait WorkerProcess: Send {
    /// 等待Worker自行退出，返回退出原因
    async fn wait(&mut self) -> String;

    /// 请求终止并等待退出
    async fn terminate(&mut self) -> OrchestratorResult<()>;
}

/// Worker启动方式
#[async_trait]
pub trait WorkerLauncher: Send + Sync {
    fn kind(&self) -> &'static str;

    /// 启动Worker，通过健康检查后返回
    async fn launch(&self, request: &LaunchRequest) -> OrchestratorResult<Box<dyn WorkerProcess>>;
}

/// 轮询Worker的 `/health` 直到成功或超时
pub async fn wait_until_healthy(
    client: &reqwest::Client,
    worker_url: &str,
    timeout: Duration,
) -> OrchestratorResult<()> {
    let health_url = format!("{}/health", worker_url.trim_end_matches('/'));
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match client
            .get(&health_url)
            .timeout(Duration::from_secs(2))
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => return Ok(()),
            Ok(response) => debug!("健康检查未通过: {} -> {}", health_url, response.status()),
            Err(e) => debug!("健康检查失败: {} -> {}", health_url, e),
        }
        if tokio::time::Instant::now() >= deadline {
            return Err(OrchestratorError::WorkerLaunch(format!(
                "Worker {worker_url} 在 {}s 内未通过健康检查",
                timeout.as_secs()
            )));
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

fn bind_address(worker_url: &str) -> OrchestratorResult<String> {
    Ok(format!("0.0.0.0:{}", parse_worker_port(worker_url)?))
}

/// 在当前进程的tokio任务中运行Worker
pub struct InProcessLauncher {
    registry: Arc<WorkerRegistry>,
    broker: Option<(Arc<dyn QueueBroker>, ConsumerConfig, Arc<SchemaRegistry>)>,
    client: reqwest::Client,
    health_timeout: Duration,
}

impl InProcessLauncher {
    pub fn new(registry: Arc<WorkerRegistry>, health_timeout: Duration) -> Self {
        Self {
            registry,
            broker: None,
            client: reqwest::Client::new(),
            health_timeout,
        }
    }

    /// Worker同时消费以作业类型命名的队列
    pub fn with_broker(
        mut self,
        broker: Arc<dyn QueueBroker>,
        config: ConsumerConfig,
        schemas: Arc<SchemaRegistry>,
    ) -> Self {
        self.broker = Some((broker, config, schemas));
        self
    }
}

struct InProcessWorker {
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<OrchestratorResult<()>>,
}

#[async_trait]
impl WorkerProcess for InProcessWorker {
    async fn wait(&mut self) -> String {
        match (&mut self.task).await {
            Ok(Ok(())) => "Worker服务已退出".to_string(),
            Ok(Err(e)) => format!("Worker服务异常退出: {e}"),
            Err(e) => format!("Worker任务崩溃: {e}"),
        }
    }

    async fn terminate(&mut self) -> OrchestratorResult<()> {
        let _ = self.shutdown_tx.send(());
        match tokio::time::timeout(Duration::from_secs(10), &mut self.task).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!("Worker未在超时内退出，强制中止");
                self.task.abort();
                Ok(())
            }
        }
    }
}

#[async_trait]
impl WorkerLauncher for InProcessLauncher {
    fn kind(&self) -> &'static str {
        "in_process"
    }

    async fn launch(&self, request: &LaunchRequest) -> OrchestratorResult<Box<dyn WorkerProcess>> {
        let handler = self
            .registry
            .create(&request.worker_class, &request.worker_params)?;
        let listener = WorkerServer::bind(&bind_address(&request.worker_url)?).await?;

        let mut server = WorkerServer::new(&request.worker_name, &request.job_type, handler);
        if let Some((broker, config, schemas)) = &self.broker {
            server = server.with_consumer(Arc::clone(broker), config.clone(), Arc::clone(schemas));
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(server.serve(listener, shutdown_rx));
        let mut worker = InProcessWorker { shutdown_tx, task };

        if let Err(e) = wait_until_healthy(&self.client, &request.worker_url, self.health_timeout).await {
            worker.terminate().await?;
            return Err(e);
        }
        info!("进程内Worker已启动: {} ({})", request.worker_name, request.worker_url);
        Ok(Box::new(worker))
    }
}

/// 以子进程方式运行Worker：`<program> worker ...`
pub struct SubprocessLauncher {
    program: PathBuf,
    config_path: Option<PathBuf>,
    client: reqwest::Client,
    health_timeout: Duration,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<PathBuf>, health_timeout: Duration) -> Self {
        Self {
            program: program.into(),
            config_path: None,
            client: reqwest::Client::new(),
            health_timeout,
        }
    }

    /// 使用当前可执行文件启动Worker
    pub fn from_current_exe(health_timeout: Duration) -> OrchestratorResult<Self> {
        let program = std::env::current_exe()
            .map_err(|e| OrchestratorError::Configuration(format!("无法获取当前可执行文件路径: {e}")))?;
        Ok(Self::new(program, health_timeout))
    }

    /// 子进程加载的配置文件
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn command_for(&self, request: &LaunchRequest) -> OrchestratorResult<Command> {
        let params = serde_json::to_string(&request.worker_params)?;
        let mut cmd = Command::new(&self.program);
        if let Some(ref path) = self.config_path {
            cmd.arg("--config").arg(path);
        }
        cmd.arg("worker")
            .args(["--name", &request.worker_name])
            .args(["--job-type", &request.job_type])
            .args(["--worker-class", &request.worker_class])
            .args(["--worker-params", &params])
            .args(["--bind", &bind_address(&request.worker_url)?])
            .stdin(Stdio::null())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

struct SubprocessWorker {
    child: Child,
}

#[async_trait]
impl WorkerProcess for SubprocessWorker {
    async fn wait(&mut self) -> String {
        match self.child.wait().await {
            Ok(status) => format!("Worker进程退出: {status}"),
            Err(e) => format!("等待Worker进程失败: {e}"),
        }
    }

    async fn terminate(&mut self) -> OrchestratorResult<()> {
        if let Ok(Some(_)) = self.child.try_wait() {
            return Ok(());
        }
        self.child
            .kill()
            .await
            .map_err(|e| OrchestratorError::Internal(format!("终止Worker进程失败: {e}")))
    }
}

#[async_trait]
impl WorkerLauncher for SubprocessLauncher {
    fn kind(&self) -> &'static str {
        "subprocess"
    }

    async fn launch(&self, request: &LaunchRequest) -> OrchestratorResult<Box<dyn WorkerProcess>> {
        let child = self.command_for(request)?.spawn().map_err(|e| {
            OrchestratorError::WorkerLaunch(format!(
                "启动Worker进程失败 {}: {e}",
                self.program.display()
            ))
        })?;
        let pid = child.id();
        let mut worker = SubprocessWorker { child };

        if let Err(e) = wait_until_healthy(&self.client, &request.worker_url, self.health_timeout).await {
            worker.terminate().await?;
            return Err(e);
        }
        info!(
            "Worker子进程已启动: {} ({}, pid={:?})",
            request.worker_name, request.worker_url, pid
        );
        Ok(Box::new(worker))
    }
}
