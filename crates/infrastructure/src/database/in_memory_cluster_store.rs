use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use orchestrator_core::{
    ClusterStore, NodeRegistration, OrchestratorResult, WorkerInstance, WorkerStatus,
    WorkerTypeRegistration,
};
use tokio::sync::RwLock;

#[derive(Debug, Default)]
struct ClusterTables {
    worker_types: BTreeMap<String, WorkerTypeRegistration>,
    nodes: BTreeMap<String, NodeRegistration>,
    workers: HashMap<String, WorkerInstance>,
}

/// 进程内集群状态存储
#[derive(Debug, Default)]
pub struct InMemoryClusterStore {
    tables: RwLock<ClusterTables>,
}

impl InMemoryClusterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sorted_by_port(mut workers: Vec<WorkerInstance>) -> Vec<WorkerInstance> {
    workers.sort_by(|a, b| (&a.node_url, a.port, a.launched_at).cmp(&(&b.node_url, b.port, b.launched_at)));
    workers
}

#[async_trait]
impl ClusterStore for InMemoryClusterStore {
    async fn upsert_worker_type(&self, registration: &WorkerTypeRegistration) -> OrchestratorResult<()> {
        self.tables
            .write()
            .await
            .worker_types
            .insert(registration.worker_name.clone(), registration.clone());
        Ok(())
    }

    async fn get_worker_type(&self, worker_name: &str) -> OrchestratorResult<Option<WorkerTypeRegistration>> {
        Ok(self.tables.read().await.worker_types.get(worker_name).cloned())
    }

    async fn list_worker_types(&self) -> OrchestratorResult<Vec<WorkerTypeRegistration>> {
        Ok(self.tables.read().await.worker_types.values().cloned().collect())
    }

    async fn upsert_node(&self, node: &NodeRegistration) -> OrchestratorResult<()> {
        self.tables
            .write()
            .await
            .nodes
            .insert(node.node_url.clone(), node.clone());
        Ok(())
    }

    async fn get_node(&self, node_url: &str) -> OrchestratorResult<Option<NodeRegistration>> {
        Ok(self.tables.read().await.nodes.get(node_url).cloned())
    }

    async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeRegistration>> {
        Ok(self.tables.read().await.nodes.values().cloned().collect())
    }

    async fn upsert_worker(&self, worker: &WorkerInstance) -> OrchestratorResult<()> {
        self.tables
            .write()
            .await
            .workers
            .insert(worker.worker_url.clone(), worker.clone());
        Ok(())
    }

    async fn get_worker(&self, worker_url: &str) -> OrchestratorResult<Option<WorkerInstance>> {
        Ok(self.tables.read().await.workers.get(worker_url).cloned())
    }

    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerInstance>> {
        let workers = self.tables.read().await.workers.values().cloned().collect();
        Ok(sorted_by_port(workers))
    }

    async fn list_node_workers(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>> {
        let workers = self
            .tables
            .read()
            .await
            .workers
            .values()
            .filter(|w| w.node_url == node_url)
            .cloned()
            .collect();
        Ok(sorted_by_port(workers))
    }

    async fn update_worker_status(&self, worker_url: &str, status: WorkerStatus) -> OrchestratorResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.workers.get_mut(worker_url) {
            Some(worker) => {
                worker.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn touch_worker(&self, worker_url: &str, at: DateTime<Utc>) -> OrchestratorResult<bool> {
        let mut tables = self.tables.write().await;
        match tables.workers.get_mut(worker_url) {
            Some(worker) => {
                worker.last_heartbeat = at;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn clear(&self) -> OrchestratorResult<()> {
        *self.tables.write().await = ClusterTables::default();
        Ok(())
    }
}
