//! 测试辅助：内存快照存储与录制用Webhook

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use dispatchd_domain::{RoundId, RoundSnapshot, SnapshotStore, WebhookSink};
use dispatchd_errors::{DispatchError, DispatchResult};

/// 纯内存的快照存储
#[derive(Default)]
pub struct MemorySnapshotStore {
    snapshots: Mutex<HashMap<RoundId, RoundSnapshot>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stored_ids(&self) -> Vec<RoundId> {
        let mut ids: Vec<RoundId> = self.snapshots.lock().unwrap().keys().cloned().collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn read(&self, round_id: &str) -> DispatchResult<Option<RoundSnapshot>> {
        Ok(self.snapshots.lock().unwrap().get(round_id).cloned())
    }

    async fn write(&self, snapshot: &RoundSnapshot) -> DispatchResult<()> {
        self.snapshots
            .lock()
            .unwrap()
            .insert(snapshot.metadata.id.clone(), snapshot.clone());
        Ok(())
    }

    async fn delete(&self, round_id: &str) -> DispatchResult<()> {
        self.snapshots.lock().unwrap().remove(round_id);
        Ok(())
    }

    async fn list_ids(&self) -> DispatchResult<Vec<RoundId>> {
        Ok(self.snapshots.lock().unwrap().keys().cloned().collect())
    }
}

/// 录制所有推送的Webhook桩；可配置为固定返回HTTP错误
pub struct MockWebhookSink {
    calls: Arc<Mutex<Vec<(String, String)>>>,
    fail_status: Mutex<Option<u16>>,
}

impl MockWebhookSink {
    pub fn new() -> Self {
        Self {
            calls: Arc::new(Mutex::new(Vec::new())),
            fail_status: Mutex::new(None),
        }
    }

    pub fn fail_with(&self, status: u16) {
        *self.fail_status.lock().unwrap() = Some(status);
    }

    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

impl Default for MockWebhookSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WebhookSink for MockWebhookSink {
    async fn post_text(&self, url: &str, text: &str) -> DispatchResult<()> {
        if let Some(status) = *self.fail_status.lock().unwrap() {
            return Err(DispatchError::WebhookHttp { status });
        }
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), text.to_string()));
        Ok(())
    }
}
