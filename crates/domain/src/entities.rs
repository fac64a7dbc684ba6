//! Domain Entities
//!
//! 核心领域实体定义，包含任务、轮次元数据与处理累计等业务核心概念。
//! 这些实体是系统的核心业务模型，不依赖于外部技术实现。

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::{NodeId, RoundId, TaskId, Timestamp};

/// 轮次显示名称的最大长度（按字符计）
pub const MAX_ROUND_NAME_CHARS: usize = 64;

/// 任务状态
///
/// 每个任务在任意时刻恰好处于四种状态之一。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    /// 待分配
    Pending,
    /// 处理中
    Processing,
    /// 已完成
    Completed,
    /// 已失败
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Processing => write!(f, "processing"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = dispatchd_errors::DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(dispatchd_errors::DispatchError::invalid_input(format!(
                "未知的任务状态: {s}"
            ))),
        }
    }
}

/// 单个文件路径任务
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,
    pub round_id: RoundId,
    pub path: String,
    pub status: TaskStatus,
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing_started_at: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_node: Option<NodeId>,
}

impl Task {
    /// 创建一个新的待分配任务，ID一经生成终身不变
    pub fn new(round_id: RoundId, path: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().simple().to_string(),
            round_id,
            path,
            status: TaskStatus::Pending,
            failure_count: 0,
            message: None,
            created_at: now,
            updated_at: now,
            processing_started_at: None,
            assigned_node: None,
        }
    }

    /// 是否已进入终态（完成或失败）
    pub fn is_terminal(&self) -> bool {
        matches!(self.status, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// 轮次生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Pending,
    Active,
    Completed,
}

impl std::fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Active => write!(f, "active"),
            Self::Completed => write!(f, "completed"),
        }
    }
}

/// 轮次任务的来源类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    /// 从清单文件导入
    File,
    /// 扫描目录导入
    Folder,
    /// 手工录入
    Manual,
}

impl Default for SourceType {
    fn default() -> Self {
        Self::Manual
    }
}

/// 按状态统计的任务数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
}

impl TaskCounts {
    /// R1: 无未完成任务（且非空，或整轮为空）即视为整轮完成
    pub fn is_complete(&self) -> bool {
        self.pending + self.processing == 0
    }
}

/// 轮次级别的处理量累计
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedTotals {
    pub total_item_num: u64,
    pub total_running_time: f64,
    #[serde(default)]
    pub last_processed_at: Option<Timestamp>,
}

impl ProcessedTotals {
    pub fn add(&mut self, item_num: u64, running_time: f64, at: Timestamp) {
        self.total_item_num += item_num;
        self.total_running_time += running_time;
        self.last_processed_at = Some(at);
    }
}

/// 轮次元数据（调度器侧的影子记录，也是快照中的 metadata 段）
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundMeta {
    pub id: RoundId,
    pub name: String,
    pub source_type: SourceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_hint: Option<String>,
    pub created_at: Timestamp,
    #[serde(default)]
    pub activated_at: Option<Timestamp>,
    #[serde(default)]
    pub completed_at: Option<Timestamp>,
    pub status: RoundStatus,
    pub counts: TaskCounts,
}

impl RoundMeta {
    pub fn new(id: RoundId, name: Option<String>, source_type: SourceType, source_hint: Option<String>) -> Self {
        let name = match name {
            Some(n) if !n.trim().is_empty() => truncate_name(n.trim()),
            _ => id.clone(),
        };
        Self {
            id,
            name,
            source_type,
            source_hint,
            created_at: Utc::now(),
            activated_at: None,
            completed_at: None,
            status: RoundStatus::Pending,
            counts: TaskCounts::default(),
        }
    }
}

/// 生成顺序轮次ID，形如 `round_0001`
pub fn format_round_id(seq: u32) -> RoundId {
    format!("round_{seq:04}")
}

/// 从轮次ID中解析序号，非法格式返回 None
pub fn parse_round_seq(id: &str) -> Option<u32> {
    id.strip_prefix("round_")?.parse().ok()
}

/// 显示名称超长时按字符截断
pub fn truncate_name(name: &str) -> String {
    if name.chars().count() <= MAX_ROUND_NAME_CHARS {
        name.to_string()
    } else {
        name.chars().take(MAX_ROUND_NAME_CHARS).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_new_defaults() {
        let task = Task::new("round_0001".to_string(), "/data/a.bin".to_string());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.failure_count, 0);
        assert!(task.processing_started_at.is_none());
        assert!(task.assigned_node.is_none());
        assert_eq!(task.created_at, task.updated_at);
        assert!(!task.id.is_empty());
    }

    #[test]
    fn test_task_status_round_trip() {
        for s in ["pending", "processing", "completed", "failed"] {
            let status: TaskStatus = s.parse().unwrap();
            assert_eq!(status.to_string(), s);
        }
        assert!("unknown".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_round_id_format_and_parse() {
        assert_eq!(format_round_id(1), "round_0001");
        assert_eq!(format_round_id(123), "round_0123");
        assert_eq!(format_round_id(10001), "round_10001");
        assert_eq!(parse_round_seq("round_0042"), Some(42));
        assert_eq!(parse_round_seq("task_0042"), None);
    }

    #[test]
    fn test_round_meta_name_defaults_to_id() {
        let meta = RoundMeta::new("round_0003".to_string(), None, SourceType::Manual, None);
        assert_eq!(meta.name, "round_0003");
        assert_eq!(meta.status, RoundStatus::Pending);

        let meta = RoundMeta::new(
            "round_0004".to_string(),
            Some("  夜间转码批次  ".to_string()),
            SourceType::File,
            Some("/lists/night.txt".to_string()),
        );
        assert_eq!(meta.name, "夜间转码批次");
    }

    #[test]
    fn test_truncate_name_by_chars() {
        let long: String = "长".repeat(80);
        let truncated = truncate_name(&long);
        assert_eq!(truncated.chars().count(), MAX_ROUND_NAME_CHARS);
    }

    #[test]
    fn test_counts_is_complete() {
        let mut counts = TaskCounts::default();
        assert!(counts.is_complete());
        counts.total = 3;
        counts.pending = 1;
        counts.completed = 2;
        assert!(!counts.is_complete());
        counts.pending = 0;
        counts.failed = 1;
        assert!(counts.is_complete());
    }

    #[test]
    fn test_task_serde_camel_case() {
        let task = Task::new("round_0001".to_string(), "/data/a.bin".to_string());
        let json = serde_json::to_value(&task).unwrap();
        assert!(json.get("roundId").is_some());
        assert!(json.get("failureCount").is_some());
        assert!(json.get("createdAt").is_some());
        // 未设置的可选字段不落盘
        assert!(json.get("assignedNode").is_none());
    }
}
