//! 轮次快照的持久化格式
//!
//! 一个轮次落盘为单个JSON文档：`metadata` 段是轮次元数据，`store` 段是
//! 任务表与各队列。字段名是对外契约的一部分，不可随意改动。

use serde::{Deserialize, Serialize};

use crate::entities::{ProcessedTotals, RoundMeta, Task};
use crate::types::{RoundId, TaskId, Timestamp};

/// 完整的轮次快照
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub metadata: RoundMeta,
    pub store: StoreSnapshot,
}

/// 任务存储段
///
/// `processing_started_at` 序列化为 `[[taskId, epochMillis], …]`。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreSnapshot {
    pub round_id: RoundId,
    pub tasks: Vec<Task>,
    pub pending_queue: Vec<TaskId>,
    pub processing_started_at: Vec<(TaskId, i64)>,
    pub completed_list: Vec<TaskId>,
    pub failed_list: Vec<TaskId>,
    pub total_processed_item_num: u64,
    pub total_processed_running_time: f64,
    #[serde(default)]
    pub last_processed_at: Option<Timestamp>,
}

impl StoreSnapshot {
    pub fn processed_totals(&self) -> ProcessedTotals {
        ProcessedTotals {
            total_item_num: self.total_processed_item_num,
            total_running_time: self.total_processed_running_time,
            last_processed_at: self.last_processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{RoundMeta, SourceType, Task};

    #[test]
    fn test_snapshot_wire_format() {
        let meta = RoundMeta::new("round_0001".to_string(), None, SourceType::File, None);
        let task = Task::new("round_0001".to_string(), "/data/a.bin".to_string());
        let snapshot = RoundSnapshot {
            metadata: meta,
            store: StoreSnapshot {
                round_id: "round_0001".to_string(),
                tasks: vec![task.clone()],
                pending_queue: vec![task.id.clone()],
                processing_started_at: vec![(task.id.clone(), 1_700_000_000_000)],
                completed_list: vec![],
                failed_list: vec![],
                total_processed_item_num: 42,
                total_processed_running_time: 3.5,
                last_processed_at: None,
            },
        };

        let json = serde_json::to_value(&snapshot).unwrap();
        let store = json.get("store").unwrap();
        assert_eq!(store.get("roundId").unwrap(), "round_0001");
        assert!(store.get("pendingQueue").unwrap().is_array());
        let started = store.get("processingStartedAt").unwrap();
        assert_eq!(started[0][0], serde_json::json!(task.id));
        assert_eq!(started[0][1], serde_json::json!(1_700_000_000_000i64));
        assert_eq!(store.get("totalProcessedItemNum").unwrap(), 42);

        // 反序列化还原
        let back: RoundSnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back.store.tasks.len(), 1);
        assert_eq!(back.store.processed_totals().total_item_num, 42);
    }
}
