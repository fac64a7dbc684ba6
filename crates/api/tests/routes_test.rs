//! API路由集成测试（不经过网络，直接驱动Router）

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use http_body_util::BodyExt;
use tower::ServiceExt;

use dispatchd_api::create_app;
use dispatchd_dispatcher::test_utils::{MemorySnapshotStore, MockWebhookSink};
use dispatchd_dispatcher::{DispatchConfig, Dispatcher};

async fn test_app() -> axum::Router {
    let dispatcher = Dispatcher::new(
        DispatchConfig::default(),
        Arc::new(MemorySnapshotStore::new()),
        Arc::new(MockWebhookSink::new()),
    )
    .await
    .expect("创建调度器失败");
    create_app(Arc::new(dispatcher))
}

fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app().await;
    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert_eq!(json["data"]["status"], "ok");
}

#[tokio::test]
async fn test_round_and_task_lifecycle_over_http() {
    let app = test_app().await;

    // 导入
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/rounds",
            serde_json::json!({"paths": ["/a", "/b"], "sourceType": "manual", "name": "测试批次"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let json = body_json(response).await;
    assert_eq!(json["data"]["added"], 2);
    assert_eq!(json["data"]["roundId"], "round_0001");
    assert_eq!(json["data"]["status"], "active");

    // 领取
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/tasks/lease",
            serde_json::json!({"batchSize": 1, "nodeId": "n1"}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    let task_id = json["data"][0]["taskId"].as_str().unwrap().to_string();
    assert_eq!(json["data"][0]["path"], "/a");

    // 回报
    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/api/tasks/{task_id}/report"),
            serde_json::json!({"success": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["status"], "completed");

    // 轮次列表反映计数
    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/rounds").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"][0]["counts"]["completed"], 1);
    assert_eq!(json["data"][0]["counts"]["pending"], 1);
    assert_eq!(json["data"][0]["name"], "测试批次");
}

#[tokio::test]
async fn test_unknown_task_returns_404_with_code() {
    let app = test_app().await;
    let response = app
        .oneshot(json_request(
            "POST",
            "/api/tasks/ghost/report",
            serde_json::json!({"success": true}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "NOT_FOUND");
}

#[tokio::test]
async fn test_config_endpoints() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/config").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["defaultBatchSize"], 8);

    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/config",
            serde_json::json!({"defaultBatchSize": 16}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["data"]["defaultBatchSize"], 16);

    // 非法更新返回400
    let response = app
        .clone()
        .oneshot(json_request(
            "PUT",
            "/api/config",
            serde_json::json!({"defaultBatchSize": 0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "INVALID_INPUT");
}

#[tokio::test]
async fn test_trigger_report_without_webhook() {
    let app = test_app().await;
    let response = app
        .oneshot(json_request("POST", "/api/report/trigger", serde_json::json!({})))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["error"]["code"], "NO_WEBHOOK");
}

#[tokio::test]
async fn test_node_endpoints() {
    let app = test_app().await;

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            "/api/nodes/processed",
            serde_json::json!({"nodeId": "n1", "itemNum": 10, "runningTime": 5.0}),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/api/nodes").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["total"], 1);
    assert_eq!(json["data"]["nodes"][0]["nodeId"], "n1");
    assert_eq!(json["data"]["summary"]["totalItemNum"], 10);

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("DELETE")
                .uri("/api/nodes/n1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    let json = body_json(response).await;
    assert_eq!(json["data"]["deleted"], true);
}
