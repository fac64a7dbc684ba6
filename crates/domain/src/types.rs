//! # 共享类型定义
//!
//! 系统中常用的标识符别名与时间类型

use chrono::{DateTime, Utc};

/// 任务ID类型（UUID字符串）
pub type TaskId = String;

/// 轮次ID类型（形如 `round_0001`）
pub type RoundId = String;

/// 节点ID类型
pub type NodeId = String;

/// 时间戳类型
pub type Timestamp = DateTime<Utc>;
