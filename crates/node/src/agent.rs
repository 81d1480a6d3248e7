use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use orchestrator_core::{
    config::NodeConfig, parse_worker_port, BackgroundDispatcher, ClusterReporter, LaunchRequest,
    NodeAgentApi, OrchestratorError, OrchestratorResult, WorkerReport, WorkerStatus,
};
use orchestrator_worker::WorkerRegistry;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, error, info, warn};

use crate::launcher::{WorkerLauncher, WorkerProcess};

type StopReply = oneshot::Sender<OrchestratorResult<()>>;

struct ManagedWorker {
    generation: u64,
    report: WorkerReport,
    stop_tx: oneshot::Sender<StopReply>,
}

struct CrashReporting {
    reporter: Arc<dyn ClusterReporter>,
    dispatcher: BackgroundDispatcher,
}

/// 节点代理
///
/// 只接受集群管理器的指令，在指定端口上启动/终止Worker，
/// 并为每个Worker运行一个监督任务，意外退出时上报管理器。
pub struct NodeAgent {
    config: NodeConfig,
    registry: Arc<WorkerRegistry>,
    launcher: Arc<dyn WorkerLauncher>,
    workers: Arc<Mutex<HashMap<String, ManagedWorker>>>,
    launch_lock: Mutex<()>,
    generation: AtomicU64,
    crash_reporting: Option<Arc<CrashReporting>>,
}

impl NodeAgent {
    pub fn new(
        config: NodeConfig,
        registry: Arc<WorkerRegistry>,
        launcher: Arc<dyn WorkerLauncher>,
    ) -> Self {
        Self {
            config,
            registry,
            launcher,
            workers: Arc::new(Mutex::new(HashMap::new())),
            launch_lock: Mutex::new(()),
            generation: AtomicU64::new(0),
            crash_reporting: None,
        }
    }

    /// Worker崩溃时通过 `dispatcher` 向管理器上报
    pub fn with_reporter(mut self, reporter: Arc<dyn ClusterReporter>, dispatcher: BackgroundDispatcher) -> Self {
        self.crash_reporting = Some(Arc::new(CrashReporting { reporter, dispatcher }));
        self
    }

    pub fn node_url(&self) -> &str {
        &self.config.node_url
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// 存活Worker名称
    pub async fn worker_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.lock().await.keys().cloned().collect();
        names.sort();
        names
    }

    fn supervise(&self, generation: u64, report: &WorkerReport, mut process: Box<dyn WorkerProcess>) -> oneshot::Sender<StopReply> {
        let (stop_tx, mut stop_rx) = oneshot::channel::<StopReply>();
        let workers = Arc::clone(&self.workers);
        let crash_reporting = self.crash_reporting.clone();
        let node_url = self.config.node_url.clone();
        let worker_name = report.worker_name.clone();

        tokio::spawn(async move {
            tokio::select! {
                stop = &mut stop_rx => {
                    let result = process.terminate().await;
                    if let Ok(reply) = stop {
                        let _ = reply.send(result);
                    }
                }
                reason = process.wait() => {
                    let removed = {
                        let mut workers = workers.lock().await;
                        match workers.get(&worker_name) {
                            Some(w) if w.generation == generation => workers.remove(&worker_name).is_some(),
                            _ => false,
                        }
                    };
                    // 已被终止流程摘除的Worker不算崩溃
                    if !removed {
                        debug!("Worker {} 退出: {}", worker_name, reason);
                        return;
                    }

                    error!("Worker {} 意外退出: {}", worker_name, reason);
                    metrics::counter!("orchestrator_worker_crashes_total").increment(1);
                    if let Some(crash_reporting) = crash_reporting {
                        let reporter = Arc::clone(&crash_reporting.reporter);
                        crash_reporting
                            .dispatcher
                            .dispatch("report_worker_down", async move {
                                reporter.worker_down(&node_url, &worker_name).await
                            })
                            .await;
                    }
                }
            }
        });
        stop_tx
    }

    async fn stop(&self, worker: ManagedWorker) -> OrchestratorResult<WorkerReport> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let mut report = worker.report;

        if worker.stop_tx.send(reply_tx).is_ok() {
            match reply_rx.await {
                Ok(result) => result?,
                // 监督任务已结束，进程已退出
                Err(_) => debug!("Worker {} 在终止前已退出", report.worker_name),
            }
        }
        report.status = WorkerStatus::Down;
        info!("Worker已终止: {} ({})", report.worker_name, report.worker_url);
        Ok(report)
    }
}

#[async_trait]
impl NodeAgentApi for NodeAgent {
    async fn launch_worker(&self, request: LaunchRequest) -> OrchestratorResult<WorkerReport> {
        if !self.registry.contains(&request.worker_class) {
            return Err(OrchestratorError::WorkerLaunch(format!(
                "未知的Worker类: {}",
                request.worker_class
            )));
        }
        let port = parse_worker_port(&request.worker_url)?;

        let _launch_guard = self.launch_lock.lock().await;
        {
            let workers = self.workers.lock().await;
            if workers.contains_key(&request.worker_name) {
                return Err(OrchestratorError::Conflict(format!(
                    "Worker {} 已在运行",
                    request.worker_name
                )));
            }
            if let Some(existing) = workers.values().find(|w| w.report.port == port) {
                return Err(OrchestratorError::Conflict(format!(
                    "端口 {port} 已被Worker {} 占用",
                    existing.report.worker_name
                )));
            }
        }

        info!(
            "启动Worker: name={}, class={}, url={}, launcher={}",
            request.worker_name,
            request.worker_class,
            request.worker_url,
            self.launcher.kind()
        );
        let process = self.launcher.launch(&request).await?;

        let report = WorkerReport {
            worker_name: request.worker_name.clone(),
            worker_url: request.worker_url.clone(),
            port,
            status: WorkerStatus::Available,
        };
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);
        // 先持锁再启动监督任务，立即崩溃的Worker也能被正确摘除
        let mut workers = self.workers.lock().await;
        let stop_tx = self.supervise(generation, &report, process);
        workers.insert(
            report.worker_name.clone(),
            ManagedWorker {
                generation,
                report: report.clone(),
                stop_tx,
            },
        );
        Ok(report)
    }

    async fn shutdown_worker(&self, worker_name: &str) -> OrchestratorResult<WorkerReport> {
        let worker = self
            .workers
            .lock()
            .await
            .remove(worker_name)
            .ok_or_else(|| OrchestratorError::WorkerNotFound {
                name: worker_name.to_string(),
            })?;
        self.stop(worker).await
    }

    async fn shutdown_all_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
        let drained: Vec<ManagedWorker> = self.workers.lock().await.drain().map(|(_, w)| w).collect();
        if drained.is_empty() {
            return Ok(Vec::new());
        }

        let mut reports = Vec::with_capacity(drained.len());
        let mut failures = Vec::new();
        for result in join_all(drained.into_iter().map(|w| self.stop(w))).await {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => failures.push(e.to_string()),
            }
        }
        if !failures.is_empty() {
            warn!("部分Worker终止失败: {:?}", failures);
            return Err(OrchestratorError::Internal(format!(
                "终止Worker失败: {}",
                failures.join("; ")
            )));
        }
        reports.sort_by_key(|r| r.port);
        Ok(reports)
    }

    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
        let mut reports: Vec<WorkerReport> = self
            .workers
            .lock()
            .await
            .values()
            .map(|w| w.report.clone())
            .collect();
        reports.sort_by_key(|r| r.port);
        Ok(reports)
    }
}
