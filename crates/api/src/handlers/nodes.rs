use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 节点处理量上报
///
/// `roundId` 为兼容保留字段：节点统计是全局的，该字段被忽略。
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedRequest {
    pub node_id: String,
    pub item_num: u64,
    pub running_time: f64,
    pub round_id: Option<String>,
}

/// 节点列表查询参数
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeQueryParams {
    pub page: Option<usize>,
    pub page_size: Option<usize>,
}

/// 记录节点处理量
pub async fn record_processed(
    State(state): State<AppState>,
    Json(request): Json<ProcessedRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    state
        .dispatcher
        .record_processed(&request.node_id, request.item_num, request.running_time)
        .await?;
    Ok(success(serde_json::json!({ "recorded": true })))
}

/// 分页列出节点统计
pub async fn list_nodes(
    State(state): State<AppState>,
    Query(params): Query<NodeQueryParams>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let page = state
        .dispatcher
        .list_nodes(params.page.unwrap_or(1), params.page_size.unwrap_or(20))
        .await;
    Ok(success(page))
}

/// 删除节点记录
pub async fn delete_node(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let deleted = state.dispatcher.delete_node(&id).await;
    Ok(success(serde_json::json!({ "deleted": deleted })))
}

/// 清空全部节点统计
pub async fn clear_nodes(
    State(state): State<AppState>,
) -> ApiResult<impl axum::response::IntoResponse> {
    state.dispatcher.clear_nodes().await;
    Ok(success(serde_json::json!({ "cleared": true })))
}
