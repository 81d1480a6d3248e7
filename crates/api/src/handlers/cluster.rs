use axum::{
    extract::{Query, State},
    response::IntoResponse,
};

use crate::{
    error::{ApiJson, ApiResult},
    response::{created, success},
    routes::ClusterState,
    types::{
        HeartbeatRequest, HeartbeatResponse, LaunchWorkerRequest, NodeRef, RegisterNodeRequest,
        RegisterWorkerTypeRequest, WorkerQuery, WorkerRef,
    },
};

/// 注册或覆盖Worker类型
pub async fn register_worker_type(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<RegisterWorkerTypeRequest>,
) -> ApiResult<impl IntoResponse> {
    let registration = state
        .manager
        .register_worker_type(
            &request.worker_name,
            &request.worker_class,
            request.worker_params,
            &request.job_type,
        )
        .await?;
    Ok(created(registration))
}

pub async fn list_worker_types(State(state): State<ClusterState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.manager.list_worker_types().await?))
}

pub async fn register_node(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<RegisterNodeRequest>,
) -> ApiResult<impl IntoResponse> {
    let node = state
        .manager
        .register_node(
            &request.node_url,
            request.port_range_start,
            request.port_range_end,
        )
        .await?;
    Ok(created(node))
}

/// 节点及其已分配端口
pub async fn list_nodes(State(state): State<ClusterState>) -> ApiResult<impl IntoResponse> {
    Ok(success(state.manager.list_nodes().await?))
}

pub async fn launch_worker(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<LaunchWorkerRequest>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .manager
        .launch_worker(
            &request.node_url,
            &request.worker_type,
            request.worker_url,
            &request.worker_name,
        )
        .await?;
    Ok(created(instance))
}

pub async fn shutdown_worker(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<WorkerRef>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .manager
        .shutdown_worker(&request.node_url, &request.worker_name)
        .await?;
    Ok(success(instance))
}

pub async fn shutdown_all_workers(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<NodeRef>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(
        state.manager.shutdown_all_workers(&request.node_url).await?,
    ))
}

/// 节点代理上报的心跳
pub async fn worker_heartbeat(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<HeartbeatRequest>,
) -> ApiResult<impl IntoResponse> {
    let touched = state
        .manager
        .worker_heartbeat(&request.node_url, &request.worker_names)
        .await?;
    Ok(success(HeartbeatResponse { touched }))
}

/// 节点代理上报的意外退出，重复上报返回空数据
pub async fn worker_down(
    State(state): State<ClusterState>,
    ApiJson(request): ApiJson<WorkerRef>,
) -> ApiResult<impl IntoResponse> {
    let instance = state
        .manager
        .worker_down(&request.node_url, &request.worker_name)
        .await?;
    Ok(success(instance))
}

pub async fn list_workers(
    State(state): State<ClusterState>,
    Query(query): Query<WorkerQuery>,
) -> ApiResult<impl IntoResponse> {
    Ok(success(
        state.manager.list_workers(query.node_url.as_deref()).await?,
    ))
}

pub async fn clear_databases(State(state): State<ClusterState>) -> ApiResult<impl IntoResponse> {
    state.manager.clear_databases().await?;
    Ok(success(()))
}
