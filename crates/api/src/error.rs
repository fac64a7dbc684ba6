use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use dispatchd_errors::DispatchError;

/// API错误类型
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度错误: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("请求参数错误: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            ApiError::Dispatch(err) => {
                let status = match err.code() {
                    "NOT_FOUND" => StatusCode::NOT_FOUND,
                    "INVALID_INPUT" | "NO_WEBHOOK" | "REPORTING_DISABLED" | "CONFIGURATION" => {
                        StatusCode::BAD_REQUEST
                    }
                    "ROUND_COMPLETED" | "NO_ACTIVE_ROUND" | "IN_FLIGHT" => StatusCode::CONFLICT,
                    "ROUND_UNAVAILABLE" => StatusCode::SERVICE_UNAVAILABLE,
                    "HTTP_ERROR" | "EXCEPTION" => StatusCode::BAD_GATEWAY,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                (status, err.code(), err.to_string())
            }
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "INVALID_INPUT", self.to_string()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message
            }
        }));
        (status, body).into_response()
    }
}

/// API结果类型
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[test]
    fn test_dispatch_error_status_mapping() {
        let resp = ApiError::Dispatch(DispatchError::task_not_found("x")).into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = ApiError::Dispatch(DispatchError::invalid_input("bad")).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = ApiError::Dispatch(DispatchError::round_completed("round_0001")).into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);

        let resp = ApiError::Dispatch(DispatchError::WebhookHttp { status: 500 }).into_response();
        assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);

        let resp =
            ApiError::Dispatch(DispatchError::round_unavailable("round_0001", "io")).into_response();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
