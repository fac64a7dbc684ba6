//! 对外返回的视图对象
//!
//! 引擎各操作的返回结构，字段名与对外JSON保持一致（camelCase）。

use serde::{Deserialize, Serialize};

use crate::entities::{ProcessedTotals, RoundMeta, RoundStatus, TaskCounts, TaskStatus};
use crate::types::{NodeId, RoundId, TaskId, Timestamp};

/// 入队结果
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueOutcome {
    pub added: usize,
    pub skipped: usize,
    pub new_task_ids: Vec<TaskId>,
}

/// 导入操作的返回
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub round_id: RoundId,
    pub name: String,
    pub counts: TaskCounts,
    pub added: usize,
    pub skipped: usize,
    pub status: RoundStatus,
}

/// 分配给节点的一条任务
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeasedTask {
    pub task_id: TaskId,
    pub round_id: RoundId,
    pub path: String,
}

/// 轮次摘要（列表接口返回）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    #[serde(flatten)]
    pub meta: RoundMeta,
    pub processed: ProcessedTotals,
}

/// 单条处理中任务的观测记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingRecord {
    pub round_id: RoundId,
    pub task_id: TaskId,
    pub path: String,
    pub status: TaskStatus,
    pub started_at: Timestamp,
    pub duration_ms: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<NodeId>,
}

/// 处理中任务的巡检报告（单轮或全局聚合）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round_id: Option<RoundId>,
    pub total_processing: usize,
    pub timed_out_count: usize,
    pub near_timeout_count: usize,
    pub longest_duration_ms: Option<i64>,
    pub top_timed_out: Vec<ProcessingRecord>,
    pub top_longest: Vec<ProcessingRecord>,
}

/// 巡检接口的返回：全局聚合 + 指定轮次（如有）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InspectResult {
    pub aggregate: ProcessingReport,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected_round: Option<ProcessingReport>,
}

/// 任务分页
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<crate::entities::Task>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

/// 轮次运行统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunStats {
    pub counts: TaskCounts,
    pub started_at: Option<Timestamp>,
    pub ended_at: Option<Timestamp>,
    pub duration_ms: Option<i64>,
    /// 完成任务数 / 运行秒数
    pub average_task_speed: Option<f64>,
    /// 处理条目数 / 累计运行秒数
    pub average_item_speed: Option<f64>,
    pub average_time_per_item: Option<f64>,
    pub average_time_per_100_items: Option<f64>,
    pub all_completed: bool,
}

/// 失败任务导出条目
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedTaskExport {
    pub round_id: RoundId,
    pub id: TaskId,
    pub path: String,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// 查找任务的返回
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FindResult {
    pub task: crate::entities::Task,
    pub round_id: RoundId,
}

/// 节点上报的一条处理记录
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProcessedRecord {
    pub timestamp: Timestamp,
    pub item_num: u64,
    pub running_time: f64,
    pub speed: f64,
}

/// 单个节点的统计视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeView {
    pub node_id: NodeId,
    pub total_item_num: u64,
    pub total_running_time: f64,
    pub record_count: u64,
    pub archived_record_count: u64,
    pub archived_item_num: u64,
    pub archived_running_time: f64,
    pub average_item_speed: Option<f64>,
    pub average_time_per_100_items: Option<f64>,
    pub last_updated: Timestamp,
    pub recent_records: Vec<NodeProcessedRecord>,
    pub request_count: u64,
    pub assigned_task_count: u64,
    pub active_task_count: usize,
    pub active_task_ids: Vec<TaskId>,
}

/// 全体节点的汇总统计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodesSummary {
    pub node_count: usize,
    pub total_item_num: u64,
    pub total_running_time: f64,
    pub record_count: u64,
    pub total_requests: u64,
    pub total_assigned_tasks: u64,
    pub total_active_tasks: usize,
    pub average_item_speed: Option<f64>,
    pub average_time_per_100_items: Option<f64>,
}

/// 节点分页 + 汇总
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePage {
    pub nodes: Vec<NodeView>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
    pub summary: NodesSummary,
}

/// 汇报状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportingState {
    pub last_report_at: Option<Timestamp>,
    pub next_report_at: Option<Timestamp>,
    pub reporting_enabled: bool,
    pub in_flight: bool,
}

/// 运行时配置视图
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchConfigView {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    pub feishu_webhook_url: Option<String>,
    pub feishu_report_interval_minutes: u32,
    /// 历史遗留配置，超时重试策略不再使用
    pub task_failure_threshold: u32,
    pub reporting: ReportingState,
}

/// 运行时配置的增量更新
///
/// `feishu_webhook_url` 为双层Option：缺省表示不修改，null表示清空。
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigPatch {
    #[serde(default)]
    pub default_batch_size: Option<u32>,
    #[serde(default)]
    pub max_batch_size: Option<u32>,
    #[serde(default, with = "double_option")]
    pub feishu_webhook_url: Option<Option<String>>,
    #[serde(default)]
    pub feishu_report_interval_minutes: Option<u32>,
    #[serde(default)]
    pub task_failure_threshold: Option<u32>,
}

/// 区分「字段缺省」与「显式null」的反序列化辅助
mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(de: D) -> Result<Option<Option<String>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Option::<String>::deserialize(de).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_patch_webhook_three_states() {
        let missing: ConfigPatch = serde_json::from_str(r#"{}"#).unwrap();
        assert!(missing.feishu_webhook_url.is_none());

        let null: ConfigPatch = serde_json::from_str(r#"{"feishuWebhookUrl": null}"#).unwrap();
        assert_eq!(null.feishu_webhook_url, Some(None));

        let set: ConfigPatch =
            serde_json::from_str(r#"{"feishuWebhookUrl": "https://open.feishu.cn/hook/x"}"#).unwrap();
        assert_eq!(
            set.feishu_webhook_url,
            Some(Some("https://open.feishu.cn/hook/x".to_string()))
        );
    }

    #[test]
    fn test_round_summary_flattens_meta() {
        use crate::entities::{RoundMeta, SourceType};
        let summary = RoundSummary {
            meta: RoundMeta::new("round_0001".to_string(), None, SourceType::Manual, None),
            processed: Default::default(),
        };
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json.get("id").unwrap(), "round_0001");
        assert!(json.get("processed").is_some());
        assert!(json.get("meta").is_none());
    }
}
