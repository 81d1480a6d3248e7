use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::ClusterReporter;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, error, info};

use crate::agent::NodeAgent;

/// 定期向集群管理器上报本节点存活的Worker
pub struct HeartbeatManager {
    agent: Arc<NodeAgent>,
    reporter: Arc<dyn ClusterReporter>,
    heartbeat_interval: Duration,
}

impl HeartbeatManager {
    pub fn new(agent: Arc<NodeAgent>, reporter: Arc<dyn ClusterReporter>) -> Self {
        let heartbeat_interval = Duration::from_secs(agent.config().heartbeat_interval_seconds.max(1));
        Self {
            agent,
            reporter,
            heartbeat_interval,
        }
    }

    pub fn with_interval(mut self, heartbeat_interval: Duration) -> Self {
        self.heartbeat_interval = heartbeat_interval;
        self
    }

    pub async fn send_heartbeat(&self) -> orchestrator_core::OrchestratorResult<()> {
        let names = self.agent.worker_names().await;
        debug!("发送心跳: node={}, workers={:?}", self.agent.node_url(), names);
        self.reporter
            .worker_heartbeat(self.agent.node_url(), &names)
            .await
    }

    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut ticker = interval(self.heartbeat_interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        error!("Failed to send node heartbeat: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Heartbeat task shutting down");
                    break;
                }
            }
        }
    }
}
