use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use orchestrator_api::{create_cluster_routes, ClusterState};
use orchestrator_cluster::ClusterManager;
use orchestrator_core::{
    config::ClusterConfig, parse_worker_port, LaunchRequest, NodeAgentApi, NodeConnector,
    OrchestratorError, OrchestratorResult, WorkerReport, WorkerStatus,
};
use orchestrator_infrastructure::InMemoryClusterStore;
use serde_json::{json, Value};
use tower::ServiceExt;

const NODE: &str = "http://127.0.0.1:8110";

#[derive(Default)]
struct FakeNodeAgent {
    running: Mutex<BTreeMap<String, WorkerReport>>,
}

#[async_trait]
impl NodeAgentApi for FakeNodeAgent {
    async fn launch_worker(&self, request: LaunchRequest) -> OrchestratorResult<WorkerReport> {
        let report = WorkerReport {
            worker_name: request.worker_name.clone(),
            port: parse_worker_port(&request.worker_url)?,
            worker_url: request.worker_url,
            status: WorkerStatus::Available,
        };
        self.running
            .lock()
            .unwrap()
            .insert(report.worker_name.clone(), report.clone());
        Ok(report)
    }

    async fn shutdown_worker(&self, worker_name: &str) -> OrchestratorResult<WorkerReport> {
        let mut report = self
            .running
            .lock()
            .unwrap()
            .remove(worker_name)
            .ok_or_else(|| OrchestratorError::WorkerNotFound {
                name: worker_name.to_string(),
            })?;
        report.status = WorkerStatus::Down;
        Ok(report)
    }

    async fn shutdown_all_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
        let drained = std::mem::take(&mut *self.running.lock().unwrap());
        Ok(drained.into_values().collect())
    }

    async fn list_workers(&self) -> OrchestratorResult<Vec<WorkerReport>> {
        Ok(self.running.lock().unwrap().values().cloned().collect())
    }
}

struct FakeConnector(Arc<FakeNodeAgent>);

impl NodeConnector for FakeConnector {
    fn connect(&self, _node_url: &str) -> OrchestratorResult<Arc<dyn NodeAgentApi>> {
        Ok(self.0.clone())
    }
}

fn app() -> Router {
    let manager = ClusterManager::new(
        Arc::new(InMemoryClusterStore::new()),
        Arc::new(FakeConnector(Arc::new(FakeNodeAgent::default()))),
        ClusterConfig::default(),
    );
    create_cluster_routes(ClusterState {
        manager: Arc::new(manager),
    })
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(match body {
            Some(body) => Body::from(body.to_string()),
            None => Body::empty(),
        })
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

async fn setup() -> Router {
    let app = app();
    let (status, _) = call(
        &app,
        "POST",
        "/api/nodes",
        Some(json!({"node_url": NODE, "port_range_start": 8200, "port_range_end": 8202})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, _) = call(
        &app,
        "POST",
        "/api/worker-types",
        Some(json!({"worker_name": "resizer", "worker_class": "echo", "job_type": "resize"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    app
}

fn launch_body(name: &str) -> Value {
    json!({"node_url": NODE, "worker_type": "resizer", "worker_name": name})
}

#[tokio::test]
async fn test_health_check() {
    let (status, body) = call(&app(), "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "cluster-manager");
}

#[tokio::test]
async fn test_launch_allocates_ports_then_conflicts() {
    let app = setup().await;

    for (name, port) in [("w1", 8200), ("w2", 8201), ("w3", 8202)] {
        let (status, body) = call(&app, "POST", "/api/workers/launch", Some(launch_body(name))).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["port"], port);
        assert_eq!(body["data"]["status"], "AVAILABLE");
    }

    let (status, body) = call(&app, "POST", "/api/workers/launch", Some(launch_body("w4"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NO_FREE_PORT");

    let (_, nodes) = call(&app, "GET", "/api/nodes", None).await;
    assert_eq!(nodes["data"][0]["assigned_ports"], json!([8200, 8201, 8202]));
}

#[tokio::test]
async fn test_shutdown_all_then_list_workers() {
    let app = setup().await;
    for name in ["w1", "w2"] {
        call(&app, "POST", "/api/workers/launch", Some(launch_body(name))).await;
    }

    let (status, body) = call(
        &app,
        "POST",
        "/api/workers/shutdown-all",
        Some(json!({"node_url": NODE})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let uri = format!("/api/workers?node_url={}", "http%3A%2F%2F127.0.0.1%3A8110");
    let (_, workers) = call(&app, "GET", &uri, None).await;
    assert!(workers["data"]
        .as_array()
        .unwrap()
        .iter()
        .all(|w| w["status"] == "DOWN"));

    let (_, body) = call(&app, "POST", "/api/workers/launch", Some(launch_body("w3"))).await;
    assert_eq!(body["data"]["port"], 8200);
}

#[tokio::test]
async fn test_not_found_and_bad_request() {
    let app = setup().await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/workers/launch",
        Some(json!({"node_url": NODE, "worker_type": "missing", "worker_name": "w1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "WORKER_TYPE_NOT_FOUND");

    let (status, body) = call(
        &app,
        "POST",
        "/api/workers/shutdown",
        Some(json!({"node_url": "http://10.0.0.9:8110", "worker_name": "w1"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["code"], "NODE_NOT_FOUND");

    let (status, body) = call(&app, "POST", "/api/nodes", Some(json!({"node_url": NODE}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "VALIDATION_ERROR");

    let (status, _) = call(
        &app,
        "POST",
        "/api/nodes",
        Some(json!({"node_url": NODE, "port_range_start": 8300, "port_range_end": 8200})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_heartbeat_down_and_clear() {
    let app = setup().await;
    call(&app, "POST", "/api/workers/launch", Some(launch_body("w1"))).await;

    let (status, body) = call(
        &app,
        "POST",
        "/api/workers/heartbeat",
        Some(json!({"node_url": NODE, "worker_names": ["w1", "ghost"]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["touched"], 1);

    let worker = json!({"node_url": NODE, "worker_name": "w1"});
    let (_, body) = call(&app, "POST", "/api/workers/down", Some(worker.clone())).await;
    assert_eq!(body["data"]["status"], "DOWN");
    let (status, body) = call(&app, "POST", "/api/workers/down", Some(worker)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].is_null());

    let (status, _) = call(&app, "POST", "/api/admin/clear-databases", None).await;
    assert_eq!(status, StatusCode::OK);
    let (_, types) = call(&app, "GET", "/api/worker-types", None).await;
    assert!(types["data"].as_array().unwrap().is_empty());
}
