//! 节点性能统计
//!
//! 与轮次无关的进程级聚合：每个节点的终身累计、两小时滑动窗口内的
//! 明细记录、请求与分配计数，以及当前在手任务集合。窗口溢出的明细
//! 归档进聚合计数，终身累计永不丢失历史。

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{Duration, Utc};
use tracing::debug;

use dispatchd_domain::{
    NodeId, NodePage, NodeProcessedRecord, NodeView, NodesSummary, TaskId, Timestamp,
};

/// 滑动窗口时长
const RECENT_WINDOW_HOURS: i64 = 2;
/// 窗口内最多保留的明细条数
const MAX_RECENT_RECORDS: usize = 500;

#[derive(Debug, Clone)]
struct NodeRecord {
    node_id: NodeId,
    total_item_num: u64,
    total_running_time: f64,
    record_count: u64,
    archived_record_count: u64,
    archived_item_num: u64,
    archived_running_time: f64,
    last_updated: Timestamp,
    recent_records: VecDeque<NodeProcessedRecord>,
    request_count: u64,
    assigned_task_count: u64,
    active_task_ids: HashSet<TaskId>,
}

impl NodeRecord {
    fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            total_item_num: 0,
            total_running_time: 0.0,
            record_count: 0,
            archived_record_count: 0,
            archived_item_num: 0,
            archived_running_time: 0.0,
            last_updated: Utc::now(),
            recent_records: VecDeque::new(),
            request_count: 0,
            assigned_task_count: 0,
            active_task_ids: HashSet::new(),
        }
    }

    /// 把窗口外以及超出条数上限的明细归档进聚合计数
    fn archive_and_trim(&mut self, now: Timestamp) {
        let cutoff = now - Duration::hours(RECENT_WINDOW_HOURS);
        while let Some(front) = self.recent_records.front() {
            if front.timestamp < cutoff {
                let record = self.recent_records.pop_front().expect("front已确认存在");
                self.archive(&record);
            } else {
                break;
            }
        }
        while self.recent_records.len() > MAX_RECENT_RECORDS {
            let record = self.recent_records.pop_front().expect("长度已检查");
            self.archive(&record);
        }
    }

    fn archive(&mut self, record: &NodeProcessedRecord) {
        self.archived_record_count += 1;
        self.archived_item_num += record.item_num;
        self.archived_running_time += record.running_time;
    }

    fn view(&self) -> NodeView {
        // 派生均值始终来自终身累计，而不是窗口
        let average_item_speed = if self.total_running_time > 0.0 {
            Some(self.total_item_num as f64 / self.total_running_time)
        } else {
            None
        };
        let average_time_per_100_items = if self.total_item_num > 0 {
            Some(self.total_running_time / self.total_item_num as f64 * 100.0)
        } else {
            None
        };
        let mut active_task_ids: Vec<TaskId> = self.active_task_ids.iter().cloned().collect();
        active_task_ids.sort();
        NodeView {
            node_id: self.node_id.clone(),
            total_item_num: self.total_item_num,
            total_running_time: self.total_running_time,
            record_count: self.record_count,
            archived_record_count: self.archived_record_count,
            archived_item_num: self.archived_item_num,
            archived_running_time: self.archived_running_time,
            average_item_speed,
            average_time_per_100_items,
            last_updated: self.last_updated,
            recent_records: self.recent_records.iter().cloned().collect(),
            request_count: self.request_count,
            assigned_task_count: self.assigned_task_count,
            active_task_count: self.active_task_ids.len(),
            active_task_ids,
        }
    }
}

pub struct NodeStatsStore {
    nodes: HashMap<NodeId, NodeRecord>,
    /// 全局 任务ID → 节点ID 索引
    task_index: HashMap<TaskId, NodeId>,
}

impl NodeStatsStore {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::new(),
            task_index: HashMap::new(),
        }
    }

    fn node_mut(&mut self, node_id: &str) -> &mut NodeRecord {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| NodeRecord::new(node_id.to_string()))
    }

    /// 记录一次领取请求
    pub fn record_lease_request(&mut self, node_id: &str) {
        let record = self.node_mut(node_id);
        record.request_count += 1;
        record.last_updated = Utc::now();
    }

    /// 记录一次任务分配
    pub fn record_assignment(&mut self, node_id: &str, task_ids: &[TaskId]) {
        let record = self.node_mut(node_id);
        record.assigned_task_count += task_ids.len() as u64;
        for id in task_ids {
            record.active_task_ids.insert(id.clone());
        }
        record.last_updated = Utc::now();
        for id in task_ids {
            self.task_index.insert(id.clone(), node_id.to_string());
        }
    }

    /// 任务结束（回报、超时或清理）时解除与节点的关联；节点记录本身保留
    pub fn detach_task(&mut self, task_id: &str) {
        if let Some(node_id) = self.task_index.remove(task_id) {
            if let Some(record) = self.nodes.get_mut(&node_id) {
                record.active_task_ids.remove(task_id);
            }
        }
    }

    /// 记录节点上报的处理量
    pub fn record_processed(&mut self, node_id: &str, item_num: u64, running_time: f64) {
        let now = Utc::now();
        let speed = if running_time > 0.0 {
            item_num as f64 / running_time
        } else {
            0.0
        };
        let record = self.node_mut(node_id);
        record.recent_records.push_back(NodeProcessedRecord {
            timestamp: now,
            item_num,
            running_time,
            speed,
        });
        record.total_item_num += item_num;
        record.total_running_time += running_time;
        record.record_count += 1;
        record.last_updated = now;
        record.archive_and_trim(now);
        debug!(
            "节点 {} 上报处理量: {} 条 / {:.2} 秒",
            node_id, item_num, running_time
        );
    }

    /// 分页列出节点（按最近更新时间降序），返回前先做一轮归档收敛
    pub fn list(&mut self, page: usize, page_size: usize) -> NodePage {
        let now = Utc::now();
        for record in self.nodes.values_mut() {
            record.archive_and_trim(now);
        }

        let mut records: Vec<&NodeRecord> = self.nodes.values().collect();
        records.sort_by(|a, b| b.last_updated.cmp(&a.last_updated));

        let total = records.len();
        let page_size = page_size.max(1);
        let last_page = total.div_ceil(page_size).max(1);
        let page = page.max(1).min(last_page);
        let nodes = records
            .iter()
            .skip((page - 1) * page_size)
            .take(page_size)
            .map(|r| r.view())
            .collect();

        NodePage {
            nodes,
            total,
            page,
            page_size,
            summary: self.summary(),
        }
    }

    /// 全体节点汇总
    pub fn summary(&self) -> NodesSummary {
        let mut summary = NodesSummary {
            node_count: self.nodes.len(),
            ..Default::default()
        };
        for record in self.nodes.values() {
            summary.total_item_num += record.total_item_num;
            summary.total_running_time += record.total_running_time;
            summary.record_count += record.record_count;
            summary.total_requests += record.request_count;
            summary.total_assigned_tasks += record.assigned_task_count;
            summary.total_active_tasks += record.active_task_ids.len();
        }
        if summary.total_running_time > 0.0 {
            summary.average_item_speed =
                Some(summary.total_item_num as f64 / summary.total_running_time);
        }
        if summary.total_item_num > 0 {
            summary.average_time_per_100_items =
                Some(summary.total_running_time / summary.total_item_num as f64 * 100.0);
        }
        summary
    }

    /// 删除节点及其在手任务索引
    pub fn delete(&mut self, node_id: &str) -> bool {
        match self.nodes.remove(node_id) {
            Some(_) => {
                self.task_index.retain(|_, owner| owner != node_id);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
        self.task_index.clear();
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }
}

impl Default for NodeStatsStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_request_and_assignment_counters() {
        let mut store = NodeStatsStore::new();
        store.record_lease_request("n1");
        store.record_assignment("n1", &["t1".to_string(), "t2".to_string(), "t3".to_string()]);

        let page = store.list(1, 10);
        assert_eq!(page.total, 1);
        let view = &page.nodes[0];
        assert_eq!(view.request_count, 1);
        assert_eq!(view.assigned_task_count, 3);
        assert_eq!(view.active_task_count, 3);
    }

    #[test]
    fn test_detach_mirrors_active_set() {
        // N2: 在手任务集合跟随分配与解除
        let mut store = NodeStatsStore::new();
        store.record_assignment("n1", &["t1".to_string(), "t2".to_string()]);
        store.detach_task("t1");

        let page = store.list(1, 10);
        assert_eq!(page.nodes[0].active_task_count, 1);
        assert_eq!(page.nodes[0].active_task_ids, vec!["t2".to_string()]);

        store.detach_task("t2");
        let page = store.list(1, 10);
        assert_eq!(page.nodes[0].active_task_count, 0);
        // 节点记录本身保留
        assert_eq!(page.total, 1);
    }

    #[test]
    fn test_processed_totals_accumulate() {
        // P7: 上报的条目与时长之和等于终身累计
        let mut store = NodeStatsStore::new();
        store.record_processed("n1", 10, 5.0);
        store.record_processed("n1", 10, 5.0);

        let page = store.list(1, 10);
        let view = &page.nodes[0];
        assert_eq!(view.total_item_num, 20);
        assert_eq!(view.total_running_time, 10.0);
        assert_eq!(view.record_count, 2);
        assert_eq!(view.average_item_speed, Some(2.0));
        assert_eq!(view.average_time_per_100_items, Some(50.0));
        assert_eq!(view.recent_records.len(), 2);
    }

    #[test]
    fn test_zero_running_time_speed() {
        let mut store = NodeStatsStore::new();
        store.record_processed("n1", 5, 0.0);
        let page = store.list(1, 10);
        assert_eq!(page.nodes[0].recent_records[0].speed, 0.0);
        assert!(page.nodes[0].average_item_speed.is_none());
    }

    #[test]
    fn test_window_overflow_archives_records() {
        // N1: 超出500条的明细归档，终身累计不变
        let mut store = NodeStatsStore::new();
        for _ in 0..(MAX_RECENT_RECORDS + 20) {
            store.record_processed("n1", 1, 0.5);
        }
        let page = store.list(1, 10);
        let view = &page.nodes[0];
        assert_eq!(view.recent_records.len(), MAX_RECENT_RECORDS);
        assert_eq!(view.archived_record_count, 20);
        assert_eq!(view.archived_item_num, 20);
        assert_eq!(view.total_item_num, (MAX_RECENT_RECORDS + 20) as u64);
        // 归档 + 窗口可还原终身累计
        let windowed: u64 = view.recent_records.iter().map(|r| r.item_num).sum();
        assert_eq!(view.archived_item_num + windowed, view.total_item_num);
    }

    #[test]
    fn test_summary_across_nodes() {
        let mut store = NodeStatsStore::new();
        store.record_processed("n1", 10, 2.0);
        store.record_processed("n2", 30, 2.0);
        store.record_lease_request("n1");
        store.record_assignment("n2", &["t1".to_string()]);

        let summary = store.summary();
        assert_eq!(summary.node_count, 2);
        assert_eq!(summary.total_item_num, 40);
        assert_eq!(summary.total_running_time, 4.0);
        assert_eq!(summary.total_requests, 1);
        assert_eq!(summary.total_assigned_tasks, 1);
        assert_eq!(summary.total_active_tasks, 1);
        assert_eq!(summary.average_item_speed, Some(10.0));
        assert_eq!(summary.average_time_per_100_items, Some(10.0));
    }

    #[test]
    fn test_empty_summary_has_no_averages() {
        let store = NodeStatsStore::new();
        let summary = store.summary();
        assert_eq!(summary.node_count, 0);
        assert!(summary.average_item_speed.is_none());
        assert!(summary.average_time_per_100_items.is_none());
    }

    #[test]
    fn test_delete_purges_task_index() {
        let mut store = NodeStatsStore::new();
        store.record_assignment("n1", &["t1".to_string()]);
        store.record_assignment("n2", &["t2".to_string()]);

        assert!(store.delete("n1"));
        assert!(!store.delete("n1"));
        assert_eq!(store.node_count(), 1);

        // n1 的索引项已清除，解除 t1 不影响 n2
        store.detach_task("t1");
        store.detach_task("t2");
        let page = store.list(1, 10);
        assert_eq!(page.nodes[0].active_task_count, 0);
    }

    #[test]
    fn test_list_sorted_by_last_updated_desc() {
        let mut store = NodeStatsStore::new();
        store.record_processed("n1", 1, 1.0);
        store.record_processed("n2", 1, 1.0);
        let page = store.list(1, 10);
        assert_eq!(page.nodes[0].node_id, "n2");
        assert_eq!(page.nodes[1].node_id, "n1");
    }
}
