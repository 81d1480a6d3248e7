use axum::{
    extract::{rejection::JsonRejection, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use orchestrator_core::OrchestratorError;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::response::ApiResponse;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Orchestrator(e) => match e {
                OrchestratorError::Conflict(_) | OrchestratorError::NoFreePort { .. } => {
                    StatusCode::CONFLICT
                }
                OrchestratorError::QueueNotFound { .. }
                | OrchestratorError::NodeNotFound { .. }
                | OrchestratorError::WorkerTypeNotFound { .. }
                | OrchestratorError::WorkerNotFound { .. } => StatusCode::NOT_FOUND,
                OrchestratorError::Validation(_)
                | OrchestratorError::Configuration(_)
                | OrchestratorError::Serialization(_) => StatusCode::BAD_REQUEST,
                OrchestratorError::BrokerUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ApiError::BadRequest(_) => "VALIDATION_ERROR",
            ApiError::Orchestrator(e) => e.code(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API请求失败: {}", self);
        } else {
            warn!("API请求被拒绝: {}", self);
        }
        (status, ApiResponse::<()>::failure(self.code(), self.to_string())).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

/// JSON请求体提取器，解析失败时返回统一的错误响应而不是纯文本
pub struct ApiJson<T>(pub T);

impl<T, S> FromRequest<S> for ApiJson<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(ApiJson(value)),
            Err(rejection) => Err(rejection.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}
