use axum::{extract::State, Json};
use serde_json::{json, Value};

use crate::routes::NodeState;

pub async fn cluster_health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "cluster-manager",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn node_health(State(state): State<NodeState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "service": "node-agent",
        "node_url": state.node_url,
        "version": env!("CARGO_PKG_VERSION")
    }))
}
