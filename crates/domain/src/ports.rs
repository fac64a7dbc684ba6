//! 核心引擎依赖的外部能力接口

use async_trait::async_trait;
use dispatchd_errors::DispatchResult;

use crate::snapshot::RoundSnapshot;
use crate::types::RoundId;

/// 轮次快照存储
///
/// 以轮次ID为键的不透明键值存储，`write` 必须是原子替换。
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn read(&self, round_id: &str) -> DispatchResult<Option<RoundSnapshot>>;
    async fn write(&self, snapshot: &RoundSnapshot) -> DispatchResult<()>;
    async fn delete(&self, round_id: &str) -> DispatchResult<()>;
    /// 枚举已存储的轮次ID（启动恢复用）
    async fn list_ids(&self) -> DispatchResult<Vec<RoundId>>;
}

/// Webhook消息通道
#[async_trait]
pub trait WebhookSink: Send + Sync {
    /// 向指定地址发送一条文本消息；HTTP失败时错误中携带状态码
    async fn post_text(&self, url: &str, text: &str) -> DispatchResult<()>;
}
