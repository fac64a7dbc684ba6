use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use dispatchd_dispatcher::ImportOptions;
use dispatchd_domain::SourceType;

use crate::{
    error::ApiResult,
    response::{created, success},
    routes::AppState,
};

/// 创建/追加轮次请求
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRoundRequest {
    pub paths: Vec<String>,
    pub name: Option<String>,
    #[serde(default)]
    pub source_type: SourceType,
    pub source_hint: Option<String>,
    pub activate: Option<bool>,
    /// 指定时向已有轮次追加
    pub round_id: Option<String>,
}

/// 导入路径，创建新轮次或向既有轮次追加
pub async fn create_round(
    State(state): State<AppState>,
    Json(request): Json<CreateRoundRequest>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let result = state
        .dispatcher
        .import(
            request.paths,
            ImportOptions {
                name: request.name,
                source_type: request.source_type,
                source_hint: request.source_hint,
                activate: request.activate,
                round_id: request.round_id,
            },
        )
        .await?;
    Ok(created(result))
}

/// 按插入顺序列出全部轮次
pub async fn list_rounds(
    State(state): State<AppState>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let rounds = state.dispatcher.list_rounds().await;
    Ok(success(rounds))
}

/// 激活指定轮次
pub async fn activate_round(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let summary = state.dispatcher.set_active(&id).await?;
    Ok(success(summary))
}

/// 轮次运行统计
pub async fn round_stats(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let stats = state.dispatcher.round_stats(Some(id)).await?;
    Ok(success(stats))
}

/// 清除单个轮次
pub async fn delete_round(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let cleared = state.dispatcher.clear_round(&id).await?;
    Ok(success(serde_json::json!({ "cleared": cleared })))
}

/// 清除全部轮次
pub async fn clear_rounds(
    State(state): State<AppState>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let cleared = state.dispatcher.clear_all().await;
    Ok(success(serde_json::json!({ "cleared": cleared })))
}
