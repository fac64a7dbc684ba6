use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;

use dispatchd_dispatcher::Dispatcher;

use crate::handlers::{
    config::{get_config, trigger_report, update_config},
    health::health_check,
    nodes::{clear_nodes, delete_node, list_nodes, record_processed},
    rounds::{activate_round, clear_rounds, create_round, delete_round, list_rounds, round_stats},
    tasks::{export_failed, find_task, inspect_processing, lease_tasks, list_tasks, report_task, sweep_tasks},
};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
}

pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/rounds", post(create_round).get(list_rounds).delete(clear_rounds))
        .route("/api/rounds/{id}/activate", post(activate_round))
        .route("/api/rounds/{id}/stats", get(round_stats))
        .route("/api/rounds/{id}", delete(delete_round))
        .route("/api/tasks", get(list_tasks))
        .route("/api/tasks/lease", post(lease_tasks))
        .route("/api/tasks/sweep", post(sweep_tasks))
        .route("/api/tasks/processing", get(inspect_processing))
        .route("/api/tasks/find", get(find_task))
        .route("/api/tasks/failed/export", get(export_failed))
        .route("/api/tasks/{id}/report", post(report_task))
        .route("/api/nodes", get(list_nodes).delete(clear_nodes))
        .route("/api/nodes/processed", post(record_processed))
        .route("/api/nodes/{id}", delete(delete_node))
        .route("/api/config", get(get_config).put(update_config))
        .route("/api/report/trigger", post(trigger_report))
        .with_state(state)
}
