use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use orchestrator_core::{
    ClusterReporter, LaunchRequest, NodeAgentApi, NodeConnector, NodeRegistration, NodeStatus,
    OrchestratorError, OrchestratorResult, WorkerInstance, WorkerReport, WorkerTypeRegistration,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::debug;

use crate::{
    response::ApiResponse,
    types::{
        HeartbeatRequest, HeartbeatResponse, LaunchWorkerRequest, NodeRef, NodeShutdownRequest,
        RegisterNodeRequest, RegisterWorkerTypeRequest, WorkerQuery, WorkerRef,
    },
};

fn network_error(url: &str, e: reqwest::Error) -> OrchestratorError {
    OrchestratorError::Network(format!("请求 {url} 失败: {e}"))
}

/// 发送请求并解包统一响应，失败响应还原为对应的错误
async fn send<T: DeserializeOwned>(
    url: &str,
    request: reqwest::RequestBuilder,
) -> OrchestratorResult<Option<T>> {
    let response = request.send().await.map_err(|e| network_error(url, e))?;
    let status = response.status();
    debug!("{} -> {}", url, status);
    let body: ApiResponse<T> = response.json().await.map_err(|e| {
        OrchestratorError::Network(format!("无法解析 {url} 的响应 (HTTP {status}): {e}"))
    })?;
    body.into_data()
}

fn required<T>(url: &str, data: Option<T>) -> OrchestratorResult<T> {
    data.ok_or_else(|| OrchestratorError::Internal(format!("{url} 的响应缺少data")))
}

#[derive(Clone)]
struct HttpClient {
    base_url: String,
    client: reqwest::Client,
}

impl HttpClient {
    fn new(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> OrchestratorResult<T> {
        let url = self.url(path);
        let data = send(&url, self.client.get(&url)).await?;
        required(&url, data)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> OrchestratorResult<Option<T>> {
        let url = self.url(path);
        send(&url, self.client.post(&url).json(body)).await
    }

    async fn post_required<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> OrchestratorResult<T> {
        let data = self.post(path, body).await?;
        required(&self.url(path), data)
    }
}

/// 集群管理器HTTP客户端
#[derive(Clone)]
pub struct ClusterApiClient {
    http: HttpClient,
}

impl ClusterApiClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(base_url, reqwest::Client::new())
    }

    pub fn with_client(base_url: &str, client: reqwest::Client) -> Self {
        Self {
            http: HttpClient::new(base_url, client),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.http.base_url
    }

    pub async fn register_worker_type(
        &self,
        worker_name: &str,
        worker_class: &str,
        worker_params: serde_json::Value,
        job_type: &str,
    ) -> OrchestratorResult<WorkerTypeRegistration> {
        let request = RegisterWorkerTypeRequest {
            worker_name: worker_name.to_string(),
            worker_class: worker_class.to_string(),
            worker_params,
            job_type: job_type.to_string(),
        };
        self.http.post_required("/api/worker-types", &request).await
    }

    pub async fn list_worker_types(&self) -> OrchestratorResult<Vec<WorkerTypeRegistration>> {
        self.http.get("/api/worker-types").await
    }

    pub async fn register_node(
        &self,
        node_url: &str,
        port_range_start: u16,
        port_range_end: u16,
    ) -> OrchestratorResult<NodeRegistration> {
        let request = RegisterNodeRequest {
            node_url: node_url.to_string(),
            port_range_start,
            port_range_end,
        };
        self.http.post_required("/api/nodes", &request).await
    }

    pub async fn list_nodes(&self) -> OrchestratorResult<Vec<NodeStatus>> {
        self.http.get("/api/nodes").await
    }

    pub async fn launch_worker(
        &self,
        node_url: &str,
        worker_type: &str,
        worker_url: Option<String>,
        worker_name: &str,
    ) -> OrchestratorResult<WorkerInstance> {
        let request = LaunchWorkerRequest {
            node_url: node_url.to_string(),
            worker_type: worker_type.to_string(),
            worker_url,
            worker_name: worker_name.to_string(),
        };
        self.http.post_required("/api/workers/launch", &request).await
    }

    pub async fn shutdown_worker(
        &self,
        node_url: &str,
        worker_name: &str,
    ) -> OrchestratorResult<WorkerInstance> {
        let request = WorkerRef {
            node_url: node_url.to_string(),
            worker_name: worker_name.to_string(),
        };
        self.http.post_required("/api/workers/shutdown", &request).await
    }

    pub async fn shutdown_all_workers(&self, node_url: &str) -> OrchestratorResult<Vec<WorkerInstance>> {
        let request = NodeRef {
            node_url: node_url.to_string(),
        };
        self.http
            .post_required("/api/workers/shutdown-all", &request)
            .await
    }

    /// 返回被刷新心跳的Worker数量
    pub async fn worker_heartbeat(
        &self,
        node_url: &str,
        worker_names: &[String],
    ) -> OrchestratorResult<usize> {
        let request = HeartbeatRequest {
            node_url: node_url.to_string(),
            worker_names: worker_names.to_vec(),
        };
        let response: HeartbeatResponse = self
            .http
            .post_required("/api/workers/heartbeat", &request)
            .await?;
        Ok(response.touched)
    }

    pub async fn worker_down(
        &self,
        node_url: &str,
        worker_name: &str,
    ) -> OrchestratorResult<Option<WorkerInstance>> {
        let request = WorkerRef {
            node_url: node_url.to_string(),
            worker_name: worker_name.to_string(),
        };
        self.http.post("/api/workers/down", &request).await
    }

    pub async fn list_workers(&self, node_url: Option<&str>) -> OrchestratorResult<Vec<WorkerInstance>> {
        let url = self.http.url("/api/workers");
        let query = WorkerQuery {
            node_url: node_url.map(str::to_string),
        };
        let data = send(&url, self.http.client.get(&url).query(&query)).await?;
        required(&url, data)
    }

    pub async fn clear_databases(&self) -> OrchestratorResult<()> {
        let _: Option<serde_json::Value> = self
            .http
            .post("/api/admin/clear-databases", &serde_json::json!({}))
            .await?;
        Ok(())
    }
}

/// 节点代理HTTP客户端
pub struct HttpNodeAgentClient {
    http: HttpClient,
}

impl HttpNodeAgentClient {
    pub fn new(node_url: &str, client: reqwest::Client) -> Self {
        Self {
            http: HttpClient::new(node_url, client),
        }
    }
}

#[async_trait]
impl NodeAgentApi for HttpNodeAgentClient {
    async fn launch_worker(&self, request: LaunchRequest) -> OrchestratorResult<WorkerReport> {
        self.http.post_required("/node/workers/launch", &request).await
    }

    async fn shutdown_worker(&self, worker_name: &str) -> OrchestratorResult<WorkerReport> {
        let request = NodeShutdownRequest {
            worker_name: worker_name.to_string(),
        };
        self.http.post_required("/node/workers/shutdown", &request).await
    }

    async fn shutdown_all_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
        self.http
            .post_required("/node/workers/shutdown-all", &serde_json::json!({}))
            .await
    }

    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
        self.http.get("/node/workers").await
    }
}

/// 按节点地址创建HTTP客户端，所有节点共用一个连接池
pub struct HttpNodeConnector {
    client: reqwest::Client,
}

impl HttpNodeConnector {
    /// `timeout` 需覆盖节点上Worker的健康检查等待
    pub fn new(timeout: Duration) -> OrchestratorResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| OrchestratorError::Configuration(format!("创建HTTP客户端失败: {e}")))?;
        Ok(Self { client })
    }
}

impl NodeConnector for HttpNodeConnector {
    fn connect(&self, node_url: &str) -> OrchestratorResult<Arc<dyn NodeAgentApi>> {
        Ok(Arc::new(HttpNodeAgentClient::new(node_url, self.client.clone())))
    }
}

/// 节点代理通过HTTP向管理器上报
pub struct HttpClusterReporter {
    cluster: ClusterApiClient,
}

impl HttpClusterReporter {
    pub fn new(cluster: ClusterApiClient) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl ClusterReporter for HttpClusterReporter {
    async fn worker_heartbeat(&self, node_url: &str, worker_names: &[String]) -> OrchestratorResult<()> {
        let touched = self.cluster.worker_heartbeat(node_url, worker_names).await?;
        debug!("心跳已上报: node={}, touched={}", node_url, touched);
        Ok(())
    }

    async fn worker_down(&self, node_url: &str, worker_name: &str) -> OrchestratorResult<()> {
        self.cluster.worker_down(node_url, worker_name).await?;
        Ok(())
    }
}
