use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{
    config::ClusterConfig, parse_worker_port, ClusterReporter, ClusterStore, LaunchRequest,
    NodeAgentApi, NodeConnector, NodeRegistration, NodeStatus, OrchestratorError,
    OrchestratorResult, WorkerInstance, WorkerReport, WorkerStatus, WorkerTypeRegistration,
};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

/// 集群管理器
///
/// Worker类型、节点与端口分配的唯一事实来源。同一节点上的分配、回收与释放
/// 由该节点的异步互斥锁串行化；不同节点之间互不阻塞。
pub struct ClusterManager {
    store: Arc<dyn ClusterStore>,
    connector: Arc<dyn NodeConnector>,
    config: ClusterConfig,
    node_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ClusterManager {
    pub fn new(
        store: Arc<dyn ClusterStore>,
        connector: Arc<dyn NodeConnector>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            store,
            connector,
            config,
            node_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    async fn lock_node(&self, node_url: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.node_locks.lock().await;
            Arc::clone(locks.entry(node_url.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    // ---- Worker类型 ----

    /// 注册或覆盖Worker类型，不校验worker_class是否存在
    pub async fn register_worker_type(
        &self,
        worker_name: &str,
        worker_class: &str,
        worker_params: serde_json::Value,
        job_type: &str,
    ) -> OrchestratorResult<WorkerTypeRegistration> {
        for (field, value) in [
            ("worker_name", worker_name),
            ("worker_class", worker_class),
            ("job_type", job_type),
        ] {
            if value.trim().is_empty() {
                return Err(OrchestratorError::Validation(format!("{field}不能为空")));
            }
        }

        let registration =
            WorkerTypeRegistration::new(worker_name, worker_class, worker_params, job_type);
        self.store.upsert_worker_type(&registration).await?;
        info!(
            "Worker类型已注册: name={}, class={}, job_type={}",
            worker_name, worker_class, job_type
        );
        Ok(registration)
    }

    pub async fn get_worker_type(&self, worker_name: &str) -> OrchestratorResult<WorkerTypeRegistration> {
        self.store
            .get_worker_type(worker_name)
            .await?
            .ok_or_else(|| OrchestratorError::WorkerTypeNotFound {
                name: worker_name.to_string(),
            })
    }

    pub async fn list_worker_types(&self) -> OrchestratorResult<Vec<WorkerTypeRegistration>> {
        self.store.list_worker_types().await
    }

    // ---- 节点 ----

    /// 注册节点；重复注册更新端口范围
    pub async fn register_node(
        &self,
        node_url: &str,
        port_range_start: u16,
        port_range_end: u16,
    ) -> OrchestratorResult<NodeRegistration> {
        let node = NodeRegistration::new(node_url, port_range_start, port_range_end)?;
        let _guard = self.lock_node(node_url).await;
        self.store.upsert_node(&node).await?;
        info!(
            "节点已注册: {} (端口 {}-{})",
            node_url, port_range_start, port_range_end
        );
        Ok(node)
    }

    async fn require_node(&self, node_url: &str) -> OrchestratorResult<NodeRegistration> {
        self.store
            .get_node(node_url)
            .await?
            .ok_or_else(|| OrchestratorError::NodeNotFound {
                node_url: node_url.to_string(),
            })
    }

    async fn live_workers(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>> {
        Ok(self
            .store
            .list_node_workers(node_url)
            .await?
            .into_iter()
            .filter(|w| w.is_live())
            .collect())
    }

    async fn status_of(&self, registration: NodeRegistration) -> OrchestratorResult<NodeStatus> {
        let ports: BTreeSet<u16> = self
            .live_workers(&registration.node_url)
            .await?
            .iter()
            .map(|w| w.port)
            .collect();
        Ok(NodeStatus {
            registration,
            assigned_ports: ports.into_iter().collect(),
        })
    }

    /// 节点注册信息及当前已分配端口
    pub async fn node_status(&self, node_url: &str) -> OrchestratorResult<NodeStatus> {
        let registration = self.require_node(node_url).await?;
        self.status_of(registration).await
    }

    pub async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeStatus>> {
        let mut statuses = Vec::new();
        for registration in self.store.list_nodes().await? {
            statuses.push(self.status_of(registration).await?);
        }
        Ok(statuses)
    }

    pub async fn list_workers(&self, node_url: Option<&str>) -> OrchestratorResult<Vec<WorkerInstance>> {
        match node_url {
            Some(node_url) => self.store.list_node_workers(node_url).await,
            None => self.store.list_workers().await,
        }
    }

    // ---- Worker生命周期 ----

    /// 在节点上启动Worker
    ///
    /// 指定 `worker_url` 时直接使用该地址，否则在节点端口范围内分配最小的空闲端口。
    /// 先记录 `Starting` 再通知节点代理；启动失败时记录置为 `Down`，端口随即释放。
    pub async fn launch_worker(
        &self,
        node_url: &str,
        worker_type: &str,
        worker_url: Option<String>,
        worker_name: &str,
    ) -> OrchestratorResult<WorkerInstance> {
        if worker_name.trim().is_empty() {
            return Err(OrchestratorError::Validation("worker_name不能为空".to_string()));
        }
        let node = self.require_node(node_url).await?;
        let registration = self.get_worker_type(worker_type).await?;
        let agent = self.connector.connect(node_url)?;

        let _guard = self.lock_node(node_url).await;
        let running = agent.list_workers().await?;
        self.reclaim_locked(node_url, &running).await?;

        let live = self.live_workers(node_url).await?;
        if live.iter().any(|w| w.worker_name == worker_name)
            || running.iter().any(|r| r.worker_name == worker_name)
        {
            return Err(OrchestratorError::Conflict(format!(
                "节点 {node_url} 上已存在名为 {worker_name} 的Worker"
            )));
        }

        // 节点代理仍在运行的Worker同样占用端口，即使管理器已将其记录置为Down
        let mut occupied: Vec<(&str, &str, u16)> = live
            .iter()
            .map(|w| (w.worker_name.as_str(), w.worker_url.as_str(), w.port))
            .collect();
        occupied.extend(
            running
                .iter()
                .map(|r| (r.worker_name.as_str(), r.worker_url.as_str(), r.port)),
        );

        let (port, worker_url) = match worker_url {
            Some(url) => {
                let port = parse_worker_port(&url)?;
                if let Some((name, _, _)) = occupied.iter().find(|(_, u, p)| *u == url || *p == port) {
                    return Err(OrchestratorError::Conflict(format!(
                        "地址 {url} 已被Worker {name} 占用"
                    )));
                }
                (port, url)
            }
            None => {
                let taken: HashSet<u16> = occupied.iter().map(|(_, _, p)| *p).collect();
                let port = lowest_free_port(&node, &taken)?;
                (port, node.worker_url_for(port)?)
            }
        };

        let mut instance =
            WorkerInstance::starting(node_url, &worker_url, port, worker_name, worker_type);
        self.store.upsert_worker(&instance).await?;
        debug!("端口 {} 已分配给Worker {} (node={})", port, worker_name, node_url);

        let request = LaunchRequest {
            worker_name: worker_name.to_string(),
            worker_type: worker_type.to_string(),
            worker_class: registration.worker_class.clone(),
            worker_params: registration.worker_params.clone(),
            job_type: registration.job_type.clone(),
            worker_url: worker_url.clone(),
        };

        match agent.launch_worker(request).await {
            Ok(report) => {
                instance.status = WorkerStatus::Available;
                instance.last_heartbeat = Utc::now();
                self.store.upsert_worker(&instance).await?;
                metrics::counter!("orchestrator_workers_launched_total").increment(1);
                info!(
                    "Worker已启动: name={}, url={}, status={}",
                    worker_name, report.worker_url, report.status
                );
                Ok(instance)
            }
            Err(e) => {
                warn!("Worker {} 启动失败，释放端口 {}: {}", worker_name, port, e);
                instance.status = WorkerStatus::Down;
                self.store.upsert_worker(&instance).await?;
                Err(e)
            }
        }
    }

    /// 将节点代理未上报的存活记录标记为Down，调用方需持有节点锁
    async fn reclaim_locked(
        &self,
        node_url: &str,
        running: &[WorkerReport],
    ) -> OrchestratorResult<Vec<WorkerInstance>> {
        let running: HashSet<&str> = running.iter().map(|r| r.worker_name.as_str()).collect();

        let mut reclaimed = Vec::new();
        for mut worker in self.live_workers(node_url).await? {
            if running.contains(worker.worker_name.as_str()) {
                continue;
            }
            warn!(
                "Worker {} 已不在节点 {} 上运行，回收端口 {}",
                worker.worker_name, node_url, worker.port
            );
            self.store
                .update_worker_status(&worker.worker_url, WorkerStatus::Down)
                .await?;
            worker.status = WorkerStatus::Down;
            reclaimed.push(worker);
        }
        Ok(reclaimed)
    }

    /// 与节点代理对账，回收已崩溃Worker的端口
    pub async fn reconcile_node(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>> {
        self.require_node(node_url).await?;
        let agent = self.connector.connect(node_url)?;
        let _guard = self.lock_node(node_url).await;
        let running = agent.list_workers().await?;
        self.reclaim_locked(node_url, &running).await
    }

    /// 终止Worker；节点代理确认退出后才释放端口
    pub async fn shutdown_worker(&self, node_url: &str, worker_name: &str) -> OrchestratorResult<WorkerInstance> {
        self.require_node(node_url).await?;
        let agent = self.connector.connect(node_url)?;
        let _guard = self.lock_node(node_url).await;

        let mut worker = self
            .live_workers(node_url)
            .await?
            .into_iter()
            .find(|w| w.worker_name == worker_name)
            .ok_or_else(|| OrchestratorError::WorkerNotFound {
                name: worker_name.to_string(),
            })?;

        match agent.shutdown_worker(worker_name).await {
            Ok(_) => {}
            // 节点上已不存在，视为已退出
            Err(OrchestratorError::WorkerNotFound { .. }) => {
                debug!("Worker {} 在节点上已不存在", worker_name);
            }
            Err(e) => return Err(e),
        }

        self.store
            .update_worker_status(&worker.worker_url, WorkerStatus::Down)
            .await?;
        worker.status = WorkerStatus::Down;
        info!("Worker已终止: name={}, port={}", worker_name, worker.port);
        Ok(worker)
    }

    /// 终止节点上全部Worker
    pub async fn shutdown_all_workers(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>> {
        self.require_node(node_url).await?;
        let agent = self.connector.connect(node_url)?;
        let _guard = self.lock_node(node_url).await;

        let reports = agent.shutdown_all_workers().await?;
        debug!("节点 {} 确认终止 {} 个Worker", node_url, reports.len());

        let mut stopped = Vec::new();
        for mut worker in self.live_workers(node_url).await? {
            self.store
                .update_worker_status(&worker.worker_url, WorkerStatus::Down)
                .await?;
            worker.status = WorkerStatus::Down;
            stopped.push(worker);
        }
        info!("节点 {} 的 {} 个Worker已全部终止", node_url, stopped.len());
        Ok(stopped)
    }

    /// 节点代理心跳：刷新上报Worker的心跳时间，返回刷新数量
    pub async fn worker_heartbeat(&self, node_url: &str, worker_names: &[String]) -> OrchestratorResult<usize> {
        self.require_node(node_url).await?;
        let now = Utc::now();
        let names: HashSet<&str> = worker_names.iter().map(|s| s.as_str()).collect();

        let mut touched = 0;
        for worker in self.live_workers(node_url).await? {
            if names.contains(worker.worker_name.as_str())
                && self.store.touch_worker(&worker.worker_url, now).await?
            {
                touched += 1;
            }
        }
        if touched < names.len() {
            debug!(
                "节点 {} 心跳中有 {} 个未知Worker",
                node_url,
                names.len() - touched
            );
        }
        Ok(touched)
    }

    /// 节点代理上报Worker意外退出；重复上报不报错
    pub async fn worker_down(&self, node_url: &str, worker_name: &str) -> OrchestratorResult<Option<WorkerInstance>> {
        self.require_node(node_url).await?;
        let _guard = self.lock_node(node_url).await;

        let Some(mut worker) = self
            .live_workers(node_url)
            .await?
            .into_iter()
            .find(|w| w.worker_name == worker_name)
        else {
            debug!("Worker {} 已不在存活列表中 (node={})", worker_name, node_url);
            return Ok(None);
        };

        self.store
            .update_worker_status(&worker.worker_url, WorkerStatus::Down)
            .await?;
        worker.status = WorkerStatus::Down;
        warn!(
            "Worker {} 意外退出，释放端口 {} (node={})",
            worker_name, worker.port, node_url
        );
        Ok(Some(worker))
    }

    /// 终止心跳超时的Available实例
    ///
    /// 节点代理确认退出（或已不存在）后才标记为Down；节点不可达时保留记录与端口，
    /// 留待下一轮检测。
    pub async fn expire_stale_workers(&self, now: DateTime<Utc>) -> OrchestratorResult<Vec<WorkerInstance>> {
        let timeout = self.config.heartbeat_timeout_seconds;
        let mut expired = Vec::new();

        for node in self.store.list_nodes().await? {
            let _guard = self.lock_node(&node.node_url).await;
            let stale: Vec<WorkerInstance> = self
                .live_workers(&node.node_url)
                .await?
                .into_iter()
                .filter(|w| w.status == WorkerStatus::Available && w.is_heartbeat_expired(now, timeout))
                .collect();
            if stale.is_empty() {
                continue;
            }

            let agent: Arc<dyn NodeAgentApi> = match self.connector.connect(&node.node_url) {
                Ok(agent) => agent,
                Err(e) => {
                    warn!("无法连接节点 {}，暂不回收失效Worker: {}", node.node_url, e);
                    continue;
                }
            };

            for mut worker in stale {
                warn!(
                    "检测到失效Worker: {} (上次心跳: {})",
                    worker.worker_name,
                    worker.last_heartbeat.format("%Y-%m-%d %H:%M:%S UTC")
                );
                match agent.shutdown_worker(&worker.worker_name).await {
                    Ok(_) => {}
                    Err(OrchestratorError::WorkerNotFound { .. }) => {
                        debug!("失效Worker {} 在节点上已不存在", worker.worker_name);
                    }
                    Err(e) => {
                        warn!(
                            "终止失效Worker {} 失败，保留端口 {}: {}",
                            worker.worker_name, worker.port, e
                        );
                        continue;
                    }
                }
                self.store
                    .update_worker_status(&worker.worker_url, WorkerStatus::Down)
                    .await?;
                worker.status = WorkerStatus::Down;
                expired.push(worker);
            }
        }
        Ok(expired)
    }

    /// 清空全部注册与分配数据
    pub async fn clear_databases(&self) -> OrchestratorResult<()> {
        self.store.clear().await?;
        self.node_locks.lock().await.clear();
        warn!("集群数据已清空");
        Ok(())
    }
}

fn lowest_free_port(node: &NodeRegistration, taken: &HashSet<u16>) -> OrchestratorResult<u16> {
    (node.port_range_start..=node.port_range_end)
        .find(|port| !taken.contains(port))
        .ok_or_else(|| OrchestratorError::NoFreePort {
            node_url: node.node_url.clone(),
            range_start: node.port_range_start,
            range_end: node.port_range_end,
        })
}

#[async_trait]
impl ClusterReporter for ClusterManager {
    async fn worker_heartbeat(&self, node_url: &str, worker_names: &[String]) -> OrchestratorResult<()> {
        ClusterManager::worker_heartbeat(self, node_url, worker_names)
            .await
            .map(|_| ())
    }

    async fn worker_down(&self, node_url: &str, worker_name: &str) -> OrchestratorResult<()> {
        ClusterManager::worker_down(self, node_url, worker_name)
            .await
            .map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use orchestrator_infrastructure::InMemoryClusterStore;
    use serde_json::json;

    const NODE: &str = "http://127.0.0.1:8110";

    mock! {
        pub Agent {}

        #[async_trait]
        impl NodeAgentApi for Agent {
            async fn launch_worker(&self, request: LaunchRequest) -> OrchestratorResult<WorkerReport>;
            async fn shutdown_worker(&self, worker_name: &str) -> OrchestratorResult<WorkerReport>;
            async fn shutdown_all_workers(&self) -> OrchestratorResult<Vec<WorkerReport>>;
            async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerReport>>;
        }
    }

    struct SingleAgent(Arc<MockAgent>);

    impl NodeConnector for SingleAgent {
        fn connect(&self, _node_url: &str) -> OrchestratorResult<Arc<dyn NodeAgentApi>> {
            Ok(self.0.clone())
        }
    }

    fn report(request: &LaunchRequest) -> WorkerReport {
        WorkerReport {
            worker_name: request.worker_name.clone(),
            worker_url: request.worker_url.clone(),
            port: parse_worker_port(&request.worker_url).unwrap(),
            status: WorkerStatus::Available,
        }
    }

    async fn manager_with(agent: MockAgent) -> ClusterManager {
        let manager = ClusterManager::new(
            Arc::new(InMemoryClusterStore::new()),
            Arc::new(SingleAgent(Arc::new(agent))),
            ClusterConfig::default(),
        );
        manager.register_node(NODE, 8200, 8202).await.unwrap();
        manager
            .register_worker_type("resizer", "echo", json!({}), "resize")
            .await
            .unwrap();
        manager
    }

    #[tokio::test]
    async fn test_failed_launch_marks_down_and_frees_port() {
        let mut agent = MockAgent::new();
        agent.expect_list_workers().returning(|| Ok(vec![]));
        agent
            .expect_launch_worker()
            .times(1)
            .returning(|_| Err(OrchestratorError::WorkerLaunch("bind failed".into())));
        agent
            .expect_launch_worker()
            .times(1)
            .returning(|request| Ok(report(&request)));
        let manager = manager_with(agent).await;

        let err = manager
            .launch_worker(NODE, "resizer", None, "w1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkerLaunch(_)));
        assert!(manager.node_status(NODE).await.unwrap().assigned_ports.is_empty());

        let worker = manager.launch_worker(NODE, "resizer", None, "w1").await.unwrap();
        assert_eq!(worker.port, 8200);
        assert_eq!(worker.status, WorkerStatus::Available);
    }

    #[tokio::test]
    async fn test_launch_request_carries_registration() {
        let mut agent = MockAgent::new();
        agent.expect_list_workers().returning(|| Ok(vec![]));
        agent
            .expect_launch_worker()
            .withf(|request| {
                request.worker_class == "echo"
                    && request.job_type == "resize"
                    && request.worker_url == "http://127.0.0.1:8200"
            })
            .returning(|request| Ok(report(&request)));
        let manager = manager_with(agent).await;

        manager.launch_worker(NODE, "resizer", None, "w1").await.unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_live_name_conflicts() {
        let mut agent = MockAgent::new();
        agent.expect_list_workers().times(1).returning(|| Ok(vec![]));
        agent.expect_list_workers().returning(|| {
            Ok(vec![WorkerReport {
                worker_name: "w1".into(),
                worker_url: "http://127.0.0.1:8200".into(),
                port: 8200,
                status: WorkerStatus::Available,
            }])
        });
        agent
            .expect_launch_worker()
            .times(1)
            .returning(|request| Ok(report(&request)));
        let manager = manager_with(agent).await;

        manager.launch_worker(NODE, "resizer", None, "w1").await.unwrap();
        let err = manager
            .launch_worker(NODE, "resizer", None, "w1")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_port_of_unrecorded_running_worker_is_skipped() {
        let mut agent = MockAgent::new();
        agent.expect_list_workers().returning(|| {
            Ok(vec![WorkerReport {
                worker_name: "orphan".into(),
                worker_url: "http://127.0.0.1:8200".into(),
                port: 8200,
                status: WorkerStatus::Available,
            }])
        });
        agent
            .expect_launch_worker()
            .withf(|request| request.worker_url == "http://127.0.0.1:8201")
            .times(1)
            .returning(|request| Ok(report(&request)));
        let manager = manager_with(agent).await;

        let worker = manager.launch_worker(NODE, "resizer", None, "w1").await.unwrap();
        assert_eq!(worker.port, 8201);
        assert!(matches!(
            manager
                .launch_worker(NODE, "resizer", Some("http://127.0.0.1:8200".into()), "w2")
                .await,
            Err(OrchestratorError::Conflict(_))
        ));
        assert!(matches!(
            manager.launch_worker(NODE, "resizer", None, "orphan").await,
            Err(OrchestratorError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_stale_worker_kept_when_agent_cannot_stop_it() {
        let mut agent = MockAgent::new();
        agent.expect_list_workers().times(1).returning(|| Ok(vec![]));
        agent
            .expect_launch_worker()
            .returning(|request| Ok(report(&request)));
        agent
            .expect_shutdown_worker()
            .times(1)
            .returning(|_| Err(OrchestratorError::Network("connection reset".into())));
        let manager = manager_with(agent).await;

        manager.launch_worker(NODE, "resizer", None, "w1").await.unwrap();
        let later = Utc::now() + chrono::Duration::seconds(3600);
        let expired = manager.expire_stale_workers(later).await.unwrap();
        assert!(expired.is_empty());
        assert_eq!(manager.node_status(NODE).await.unwrap().assigned_ports, vec![8200]);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_port_when_agent_fails() {
        let mut agent = MockAgent::new();
        agent.expect_list_workers().returning(|| Ok(vec![]));
        agent
            .expect_launch_worker()
            .returning(|request| Ok(report(&request)));
        agent
            .expect_shutdown_worker()
            .returning(|_| Err(OrchestratorError::Network("connection refused".into())));
        let manager = manager_with(agent).await;

        manager.launch_worker(NODE, "resizer", None, "w1").await.unwrap();
        assert!(manager.shutdown_worker(NODE, "w1").await.is_err());
        assert_eq!(manager.node_status(NODE).await.unwrap().assigned_ports, vec![8200]);
    }

    #[tokio::test]
    async fn test_unknown_node_and_type() {
        let manager = manager_with(MockAgent::new()).await;
        assert!(matches!(
            manager.launch_worker("http://10.0.0.9:8110", "resizer", None, "w1").await,
            Err(OrchestratorError::NodeNotFound { .. })
        ));
        assert!(matches!(
            manager.launch_worker(NODE, "missing", None, "w1").await,
            Err(OrchestratorError::WorkerTypeNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_worker_type_upsert_and_validation() {
        let manager = manager_with(MockAgent::new()).await;
        manager
            .register_worker_type("resizer", "shell", json!({"command": "convert"}), "resize_v2")
            .await
            .unwrap();
        let stored = manager.get_worker_type("resizer").await.unwrap();
        assert_eq!(stored.worker_class, "shell");
        assert_eq!(manager.list_worker_types().await.unwrap().len(), 1);

        assert!(matches!(
            manager.register_worker_type("", "echo", json!({}), "x").await,
            Err(OrchestratorError::Validation(_))
        ));
    }
}
