//! 飞书群机器人Webhook客户端

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, error};

use dispatchd_domain::WebhookSink;
use dispatchd_errors::{DispatchError, DispatchResult};

pub struct FeishuWebhookClient {
    http_client: reqwest::Client,
}

impl FeishuWebhookClient {
    pub fn new(request_timeout: Duration) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http_client }
    }

    /// 组装飞书文本消息体：`{"msg_type":"text","content":{"text":…}}`
    pub fn build_payload(text: &str) -> serde_json::Value {
        json!({
            "msg_type": "text",
            "content": { "text": text }
        })
    }
}

impl Default for FeishuWebhookClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(10))
    }
}

#[async_trait]
impl WebhookSink for FeishuWebhookClient {
    async fn post_text(&self, url: &str, text: &str) -> DispatchResult<()> {
        let payload = Self::build_payload(text);

        match self.http_client.post(url).json(&payload).send().await {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    debug!("飞书消息推送成功");
                    Ok(())
                } else {
                    let body = response.text().await.unwrap_or_default();
                    error!("飞书消息推送失败: HTTP {} - {}", status, body);
                    Err(DispatchError::WebhookHttp {
                        status: status.as_u16(),
                    })
                }
            }
            Err(e) => {
                error!("飞书消息发送异常: {}", e);
                Err(DispatchError::WebhookTransport(e.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_payload_shape() {
        let payload = FeishuWebhookClient::build_payload("所有轮次已完成");
        assert_eq!(payload["msg_type"], "text");
        assert_eq!(payload["content"]["text"], "所有轮次已完成");
    }

    #[tokio::test]
    async fn test_post_text_transport_error() {
        // 未监听的本地端口，连接必然失败
        let client = FeishuWebhookClient::new(Duration::from_millis(500));
        let err = client
            .post_text("https://127.0.0.1:1/hook", "测试")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "EXCEPTION");
    }
}
