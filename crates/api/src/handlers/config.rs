use axum::{extract::State, Json};

use dispatchd_domain::ConfigPatch;

use crate::{error::ApiResult, response::success, routes::AppState};

/// 查询运行时配置
pub async fn get_config(
    State(state): State<AppState>,
) -> ApiResult<impl axum::response::IntoResponse> {
    Ok(success(state.dispatcher.get_config().await))
}

/// 增量更新运行时配置
pub async fn update_config(
    State(state): State<AppState>,
    Json(patch): Json<ConfigPatch>,
) -> ApiResult<impl axum::response::IntoResponse> {
    let view = state.dispatcher.update_config(patch).await?;
    Ok(success(view))
}

/// 手动触发一次进度汇报
pub async fn trigger_report(
    State(state): State<AppState>,
) -> ApiResult<impl axum::response::IntoResponse> {
    state.dispatcher.trigger_report().await?;
    Ok(success(serde_json::json!({ "triggered": true })))
}
