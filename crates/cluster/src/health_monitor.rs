use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use orchestrator_core::{OrchestratorResult, WorkerInstance};
use tokio::sync::broadcast;
use tracing::{error, info};

use crate::manager::ClusterManager;

/// 周期性检测心跳超时的Worker，经节点代理终止后释放其端口
pub struct HealthMonitor {
    manager: Arc<ClusterManager>,
    interval: Duration,
}

impl HealthMonitor {
    pub fn new(manager: Arc<ClusterManager>) -> Self {
        let interval = Duration::from_secs(manager.config().health_check_interval_seconds.max(1));
        Self { manager, interval }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// 执行一次检测
    pub async fn check_once(&self) -> OrchestratorResult<Vec<WorkerInstance>> {
        let expired = self.manager.expire_stale_workers(Utc::now()).await?;
        if !expired.is_empty() {
            info!("检测到 {} 个失效的Worker", expired.len());
        }
        Ok(expired)
    }

    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        info!("启动Worker健康检测循环 (间隔 {:?})", self.interval);
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("收到停止信号，退出Worker健康检测循环");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.check_once().await {
                        error!("Worker健康检测时出错: {}", e);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use orchestrator_core::{
        config::ClusterConfig, ClusterStore, LaunchRequest, NodeAgentApi, NodeConnector,
        OrchestratorError, WorkerReport, WorkerStatus,
    };
    use orchestrator_infrastructure::InMemoryClusterStore;

    const NODE: &str = "http://127.0.0.1:8110";

    struct Unreachable;

    impl NodeConnector for Unreachable {
        fn connect(&self, node_url: &str) -> OrchestratorResult<Arc<dyn NodeAgentApi>> {
            Err(OrchestratorError::Network(format!("{node_url} unreachable")))
        }
    }

    /// 节点上的Worker均已退出
    struct EmptyNode;

    #[async_trait]
    impl NodeAgentApi for EmptyNode {
        async fn launch_worker(&self, request: LaunchRequest) -> OrchestratorResult<WorkerReport> {
            Err(OrchestratorError::WorkerLaunch(request.worker_name))
        }

        async fn shutdown_worker(&self, worker_name: &str) -> OrchestratorResult<WorkerReport> {
            Err(OrchestratorError::WorkerNotFound {
                name: worker_name.to_string(),
            })
        }

        async fn shutdown_all_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
            Ok(vec![])
        }

        async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
            Ok(vec![])
        }
    }

    impl NodeConnector for EmptyNode {
        fn connect(&self, _node_url: &str) -> OrchestratorResult<Arc<dyn NodeAgentApi>> {
            Ok(Arc::new(EmptyNode))
        }
    }

    async fn manager_with_workers(connector: Arc<dyn NodeConnector>) -> Arc<ClusterManager> {
        let store = Arc::new(InMemoryClusterStore::new());
        let config = ClusterConfig {
            heartbeat_timeout_seconds: 30,
            ..Default::default()
        };
        let manager = Arc::new(ClusterManager::new(store.clone(), connector, config));
        manager.register_node(NODE, 8200, 8210).await.unwrap();

        let mut stale = WorkerInstance::starting(NODE, "http://127.0.0.1:8200", 8200, "stale", "resizer");
        stale.status = WorkerStatus::Available;
        stale.last_heartbeat = Utc::now() - chrono::Duration::seconds(120);
        store.upsert_worker(&stale).await.unwrap();

        let mut fresh = WorkerInstance::starting(NODE, "http://127.0.0.1:8201", 8201, "fresh", "resizer");
        fresh.status = WorkerStatus::Available;
        store.upsert_worker(&fresh).await.unwrap();
        manager
    }

    #[tokio::test]
    async fn test_stale_available_worker_is_marked_down() {
        let manager = manager_with_workers(Arc::new(EmptyNode)).await;

        let monitor = HealthMonitor::new(manager.clone());
        let expired = monitor.check_once().await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].worker_name, "stale");

        let status = manager.node_status(NODE).await.unwrap();
        assert_eq!(status.assigned_ports, vec![8201]);
    }

    #[tokio::test]
    async fn test_unreachable_node_keeps_stale_port() {
        let manager = manager_with_workers(Arc::new(Unreachable)).await;

        let expired = HealthMonitor::new(manager.clone()).check_once().await.unwrap();
        assert!(expired.is_empty());
        let status = manager.node_status(NODE).await.unwrap();
        assert_eq!(status.assigned_ports, vec![8200, 8201]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let manager = Arc::new(ClusterManager::new(
            Arc::new(InMemoryClusterStore::new()),
            Arc::new(Unreachable),
            ClusterConfig::default(),
        ));
        let monitor = HealthMonitor::new(manager).with_interval(Duration::from_millis(10));
        let (tx, rx) = broadcast::channel(1);
        let handle = tokio::spawn(async move { monitor.run(rx).await });
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
