use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use dispatchd_domain::TaskStatus;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

/// 领取任务请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRequest {
    pub batch_size: Option<u32>,
    pub round_id: Option<String>,
    pub node_id: Option<String>,
}

/// 任务回报请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportRequest {
    pub success: bool,
    pub message: Option<String>,
}

/// 超时巡检请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SweepRequest {
    pub timeout_ms: i64,
    pub round_id: Option<String>,
}

/// 处理中巡检查询参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectParams {
    #[serde(default)]
    pub timeout_ms: i64,
    pub round_id: Option<String>,
}

/// 任务列表查询参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskQueryParams {
    pub status: Option<String>,
    pub page: Option<usize>,
    pub page_size: Option<usize>,
    pub round_id: Option<String>,
}

/// 任务查找参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindParams {
    pub query: String,
    pub round_id: Option<String>,
}

/// 失败任务导出参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportParams {
    pub round_id: Option<String>,
    pub limit: Option<usize>,
}

/// 批量领取任务
pub async fn lease_tasks(
    State(state): State<AppState>,
    Json(request): Json<LeaseRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let tasks = state
        .dispatcher
        .lease(request.batch_size, request.round_id, request.node_id)
        .await?;
    Ok(success(tasks))
}

/// 回报任务结果
pub async fn report_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ReportRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let status = state
        .dispatcher
        .report(&id, request.success, request.message)
        .await?;
    Ok(success(serde_json::json!({ "status": status })))
}

/// 触发一次超时巡检
pub async fn sweep_tasks(
    State(state): State<AppState>,
    Json(request): Json<SweepRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let touched = state
        .dispatcher
        .sweep(request.timeout_ms, request.round_id)
        .await?;
    Ok(success(serde_json::json!({ "touched": touched })))
}

/// 处理中任务巡检报告
pub async fn inspect_processing(
    State(state): State<AppState>,
    Query(params): Query<InspectParams>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let result = state
        .dispatcher
        .inspect(params.timeout_ms, params.round_id)
        .await?;
    Ok(success(result))
}

/// 分页列出任务
pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let status = match params.status.as_deref() {
        None | Some("") | Some("all") => None,
        Some(raw) => Some(
            raw.parse::<TaskStatus>()
                .map_err(|e| ApiError::BadRequest(e.to_string()))?,
        ),
    };
    let page = state
        .dispatcher
        .list_tasks(
            status,
            params.page.unwrap_or(1),
            params.page_size.unwrap_or(20),
            params.round_id,
        )
        .await?;
    Ok(success(page))
}

/// 按任务ID或路径查找任务
pub async fn find_task(
    State(state): State<AppState>,
    Query(params): Query<FindParams>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let found = state
        .dispatcher
        .find_task(&params.query, params.round_id)
        .await?;
    Ok(success(found))
}

/// 导出失败任务
pub async fn export_failed(
    State(state): State<AppState>,
    Query(params): Query<ExportParams>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let exports = state
        .dispatcher
        .export_failed(params.round_id, params.limit)
        .await?;
    Ok(success(exports))
}
