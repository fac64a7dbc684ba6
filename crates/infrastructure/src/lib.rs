pub mod feishu;
pub mod snapshot_store;

pub use feishu::FeishuWebhookClient;
pub use snapshot_store::FileSnapshotStore;
