pub mod error;
pub mod handlers;
pub mod response;
pub mod routes;

use axum::Router;
use std::sync::Arc;

use dispatchd_dispatcher::Dispatcher;
use routes::{create_routes, AppState};

/// 创建完整的API应用
pub fn create_app(dispatcher: Arc<Dispatcher>) -> Router {
    create_routes(AppState { dispatcher })
}
