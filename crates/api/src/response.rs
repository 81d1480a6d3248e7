use axum::{http::StatusCode, response::IntoResponse, Json};
use orchestrator_core::{OrchestratorError, OrchestratorResult};
use serde::{Deserialize, Serialize};

/// 失败响应中的错误信息，`code` 与 [`OrchestratorError::code`] 一致
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub error: Option<ErrorBody>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ErrorBody {
                code: code.into(),
                message: message.into(),
            }),
            timestamp: chrono::Utc::now(),
        }
    }

    /// 客户端侧解包：失败响应按错误码还原为 [`OrchestratorError`]
    pub fn into_data(self) -> OrchestratorResult<Option<T>> {
        if self.success {
            return Ok(self.data);
        }
        Err(match self.error {
            Some(error) => OrchestratorError::from_code(&error.code, error.message),
            None => OrchestratorError::Internal("失败响应缺少错误信息".to_string()),
        })
    }
}

impl<T> IntoResponse for ApiResponse<T>
where
    T: Serialize,
{
    fn into_response(self) -> axum::response::Response {
        Json(self).into_response()
    }
}

pub fn success<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::OK, ApiResponse::success(data))
}

pub fn created<T: Serialize>(data: T) -> impl IntoResponse {
    (StatusCode::CREATED, ApiResponse::success(data))
}
