use axum::{extract::State, response::IntoResponse};
use orchestrator_core::LaunchRequest;

use crate::{
    error::{ApiJson, ApiResult},
    response::{created, success},
    routes::NodeState,
    types::NodeShutdownRequest,
};

pub async fn launch_worker(
    State(state): State<NodeState>,
    ApiJson(request): ApiJson<LaunchRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(created(state.agent.launch_worker(request).await?))
}

pub async fn shutdown_worker(
    State(state): State<NodeState>,
    ApiJson(request): ApiJson<NodeShutdownRequest>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(state.agent.shutdown_worker(&request.worker_name).await?))
}

pub async fn shutdown_all_workers(State(state): State<NodeState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.agent.shutdown_all_workers().await?))
}

pub async fn list_workers(State(state): State<NodeState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.agent.list_workers().await?))
}
