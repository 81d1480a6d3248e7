use std::sync::Arc;
use std::time::Duration;

use orchestrator_core::{config::ConsumerConfig, JobMessage, QueueBroker, QueueOptions};
use orchestrator_infrastructure::InMemoryBroker;
use orchestrator_worker::{SchemaRegistry, WorkerRegistry, WorkerServer};
use serde_json::{json, Value};
use tokio::sync::broadcast;

async fn start_server(server: WorkerServer) -> (String, broadcast::Sender<()>, tokio::task::JoinHandle<()>) {
    let listener = WorkerServer::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = broadcast::channel(1);
    let handle = tokio::spawn(async move {
        server.serve(listener, rx).await.unwrap();
    });
    (format!("http://{addr}"), tx, handle)
}

#[tokio::test]
async fn test_health_and_run_endpoints() {
    let registry = WorkerRegistry::with_builtin_workers();
    let handler = registry.create("echo", &json!({"prefix": "w1"})).unwrap();
    let (base_url, shutdown, handle) = start_server(WorkerServer::new("echo-1", "echo", handler)).await;
    let client = reqwest::Client::new();

    let health: Value = client
        .get(format!("{base_url}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["worker_name"], "echo-1");

    let job = JobMessage::new("echo", json!({"text": "hello"}), 0);
    let response = client
        .post(format!("{base_url}/run"))
        .json(&job)
        .send()
        .await
        .unwrap();
    assert!(response.status().is_success());
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["data"]["payload"]["text"], "hello");

    let wrong_type = JobMessage::new("resize", json!({}), 0);
    let response = client
        .post(format!("{base_url}/run"))
        .json(&wrong_type)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 400);

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_failed_job_returns_server_error() {
    let registry = WorkerRegistry::with_builtin_workers();
    let handler = registry.create("failing", &json!({"message": "boom"})).unwrap();
    let (base_url, shutdown, handle) = start_server(WorkerServer::new("f-1", "flaky", handler)).await;

    let response = reqwest::Client::new()
        .post(format!("{base_url}/run"))
        .json(&JobMessage::new("flaky", json!({}), 0))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status().as_u16(), 500);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "boom");

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_consumer_loop_drains_job_type_queue() {
    let broker = Arc::new(InMemoryBroker::new());
    broker.declare_queue("echo", &QueueOptions::default()).await.unwrap();
    for n in 0..3 {
        broker
            .publish("echo", &JobMessage::new("echo", json!({"n": n}), 1))
            .await
            .unwrap();
    }

    let handler = WorkerRegistry::with_builtin_workers()
        .create("echo", &Value::Null)
        .unwrap();
    let server = WorkerServer::new("echo-consumer", "echo", handler).with_consumer(
        broker.clone(),
        ConsumerConfig::default(),
        Arc::new(SchemaRegistry::new()),
    );
    let (_base_url, shutdown, handle) = start_server(server).await;

    let mut remaining = u64::MAX;
    for _ in 0..50 {
        remaining = broker.count_queue_messages("echo").await.unwrap();
        if remaining == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(remaining, 0);

    shutdown.send(()).unwrap();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
}
