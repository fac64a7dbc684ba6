use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use dispatchd_api::create_app;
use dispatchd_config::AppConfig;
use dispatchd_dispatcher::{DispatchConfig, Dispatcher};
use dispatchd_infrastructure::{FeishuWebhookClient, FileSnapshotStore};
use tokio::{net::TcpListener, sync::broadcast};
use tracing::{info, warn};

/// 主应用程序
///
/// 负责把配置、快照存储、Webhook客户端与调度器组装起来，
/// 并驱动HTTP服务、超时巡检与定时汇报三条循环。
pub struct Application {
    config: AppConfig,
    dispatcher: Arc<Dispatcher>,
}

impl Application {
    /// 创建新的应用实例
    pub async fn new(config: AppConfig) -> Result<Self> {
        info!("初始化应用程序");

        let snapshots = Arc::new(
            FileSnapshotStore::new(&config.persistence.data_dir)
                .context("初始化快照存储失败")?,
        );
        let webhook = Arc::new(FeishuWebhookClient::new(Duration::from_secs(
            config.webhook.request_timeout_seconds,
        )));

        let dispatch_config = DispatchConfig {
            default_batch_size: config.dispatch.default_batch_size,
            max_batch_size: config.dispatch.max_batch_size,
            feishu_webhook_url: config.webhook.feishu_webhook_url.clone(),
            feishu_report_interval_minutes: config.webhook.report_interval_minutes,
            task_failure_threshold: config.dispatch.task_failure_threshold,
        };
        let dispatcher = Arc::new(
            Dispatcher::new(dispatch_config, snapshots, webhook)
                .await
                .context("初始化调度器失败")?,
        );

        Ok(Self { config, dispatcher })
    }

    /// 运行应用直到收到关闭信号
    pub async fn run(&self, mut shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        // 超时巡检循环
        let sweep_handle = if self.config.dispatch.sweep_interval_seconds > 0 {
            let dispatcher = Arc::clone(&self.dispatcher);
            let interval = Duration::from_secs(self.config.dispatch.sweep_interval_seconds);
            let threshold_ms = self.config.dispatch.processing_timeout_ms as i64;
            Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    match dispatcher.sweep(threshold_ms, None).await {
                        Ok(0) => {}
                        Ok(n) => info!("巡检处理超时任务 {} 个", n),
                        Err(e) => warn!("超时巡检失败: {}", e),
                    }
                }
            }))
        } else {
            info!("内置超时巡检已关闭");
            None
        };

        // 定时汇报循环
        let report_handle = {
            let dispatcher = Arc::clone(&self.dispatcher);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(60));
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    ticker.tick().await;
                    if dispatcher.maybe_periodic_report().await {
                        info!("定时进度汇报已发送");
                    }
                }
            })
        };

        // HTTP服务
        let app = create_app(Arc::clone(&self.dispatcher));
        let addr = format!("{}:{}", self.config.server.host, self.config.server.port);
        let listener = TcpListener::bind(&addr)
            .await
            .with_context(|| format!("绑定地址失败: {addr}"))?;
        info!("HTTP服务监听于 {}", addr);

        let server = axum::serve(listener, app);
        tokio::select! {
            result = server => {
                result.context("HTTP服务异常退出")?;
            }
            _ = shutdown_rx.recv() => {
                info!("HTTP服务开始关闭");
            }
        }

        if let Some(handle) = sweep_handle {
            handle.abort();
        }
        report_handle.abort();

        // 关闭前把热轮次落盘
        self.dispatcher.flush_all().await;
        info!("热轮次快照已全部落盘");

        Ok(())
    }
}
