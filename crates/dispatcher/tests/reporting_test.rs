//! 运行时配置与汇报链路测试

use std::sync::Arc;

use dispatchd_dispatcher::test_utils::{MemorySnapshotStore, MockWebhookSink};
use dispatchd_dispatcher::{DispatchConfig, Dispatcher, ImportOptions};
use dispatchd_domain::ConfigPatch;

async fn setup(config: DispatchConfig) -> (Dispatcher, Arc<MockWebhookSink>) {
    let snapshots = Arc::new(MemorySnapshotStore::new());
    let webhook = Arc::new(MockWebhookSink::new());
    let dispatcher = Dispatcher::new(config, snapshots, webhook.clone())
        .await
        .expect("创建调度器失败");
    (dispatcher, webhook)
}

#[tokio::test]
async fn test_get_config_defaults() {
    let (dispatcher, _) = setup(DispatchConfig::default()).await;
    let view = dispatcher.get_config().await;
    assert_eq!(view.default_batch_size, 8);
    assert_eq!(view.max_batch_size, 1000);
    assert_eq!(view.feishu_report_interval_minutes, 240);
    assert!(view.feishu_webhook_url.is_none());
    assert!(view.reporting.reporting_enabled);
    // 未配置Webhook时没有下一次汇报时间
    assert!(view.reporting.next_report_at.is_none());
    assert!(!view.reporting.in_flight);
}

#[tokio::test]
async fn test_update_config_validation() {
    let (dispatcher, _) = setup(DispatchConfig::default()).await;

    let err = dispatcher
        .update_config(ConfigPatch {
            default_batch_size: Some(0),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let err = dispatcher
        .update_config(ConfigPatch {
            default_batch_size: Some(100),
            max_batch_size: Some(10),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    let err = dispatcher
        .update_config(ConfigPatch {
            feishu_webhook_url: Some(Some("http://insecure.example.com".to_string())),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_INPUT");

    // 校验失败的更新不落地
    let view = dispatcher.get_config().await;
    assert_eq!(view.default_batch_size, 8);
    assert_eq!(view.max_batch_size, 1000);
}

#[tokio::test]
async fn test_update_config_reconfigures_reporting() {
    let (dispatcher, _) = setup(DispatchConfig::default()).await;

    let view = dispatcher
        .update_config(ConfigPatch {
            feishu_webhook_url: Some(Some("https://open.feishu.cn/hook/x".to_string())),
            feishu_report_interval_minutes: Some(30),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(
        view.feishu_webhook_url.as_deref(),
        Some("https://open.feishu.cn/hook/x")
    );
    assert_eq!(view.feishu_report_interval_minutes, 30);
    assert!(view.reporting.reporting_enabled);
    assert!(view.reporting.next_report_at.is_some());

    // 间隔归零等于停用汇报
    let view = dispatcher
        .update_config(ConfigPatch {
            feishu_report_interval_minutes: Some(0),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!view.reporting.reporting_enabled);

    // null 清空Webhook地址
    let view = dispatcher
        .update_config(ConfigPatch {
            feishu_webhook_url: Some(None),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(view.feishu_webhook_url.is_none());
}

#[tokio::test]
async fn test_trigger_report_requires_webhook() {
    let (dispatcher, _) = setup(DispatchConfig::default()).await;
    let err = dispatcher.trigger_report().await.unwrap_err();
    assert_eq!(err.code(), "NO_WEBHOOK");
}

#[tokio::test]
async fn test_trigger_report_disabled_when_interval_zero() {
    let config = DispatchConfig {
        feishu_webhook_url: Some("https://open.feishu.cn/hook/x".to_string()),
        feishu_report_interval_minutes: 0,
        ..Default::default()
    };
    let (dispatcher, _) = setup(config).await;
    let err = dispatcher.trigger_report().await.unwrap_err();
    assert_eq!(err.code(), "REPORTING_DISABLED");
}

#[tokio::test]
async fn test_trigger_report_posts_progress() {
    let config = DispatchConfig {
        feishu_webhook_url: Some("https://open.feishu.cn/hook/x".to_string()),
        ..Default::default()
    };
    let (dispatcher, webhook) = setup(config).await;
    dispatcher
        .import(
            vec!["/a".to_string(), "/b".to_string()],
            ImportOptions::default(),
        )
        .await
        .unwrap();

    dispatcher.trigger_report().await.unwrap();
    let calls = webhook.calls();
    assert_eq!(calls.len(), 1);
    assert!(calls[0].1.contains("任务进度通报"));
    assert!(calls[0].1.contains("共 2 个"));

    // 手动汇报不触碰完成摘要
    assert!(dispatcher.completion_digest().await.is_none());

    let view = dispatcher.get_config().await;
    assert!(view.reporting.last_report_at.is_some());
    assert!(!view.reporting.in_flight);
}

#[tokio::test]
async fn test_trigger_report_http_failure_clears_in_flight() {
    let config = DispatchConfig {
        feishu_webhook_url: Some("https://open.feishu.cn/hook/x".to_string()),
        ..Default::default()
    };
    let (dispatcher, webhook) = setup(config).await;
    webhook.fail_with(502);

    let err = dispatcher.trigger_report().await.unwrap_err();
    assert_eq!(err.code(), "HTTP_ERROR");

    // in_flight 已复位，再次触发仍然得到HTTP错误而不是 IN_FLIGHT
    let err = dispatcher.trigger_report().await.unwrap_err();
    assert_eq!(err.code(), "HTTP_ERROR");
}

#[tokio::test]
async fn test_periodic_report_not_due() {
    let config = DispatchConfig {
        feishu_webhook_url: Some("https://open.feishu.cn/hook/x".to_string()),
        feishu_report_interval_minutes: 240,
        ..Default::default()
    };
    let (dispatcher, webhook) = setup(config).await;
    // 刚启动时下一次汇报在4小时后
    assert!(!dispatcher.maybe_periodic_report().await);
    assert_eq!(webhook.call_count(), 0);
}
