//! 单个轮次的任务存储与状态机
//!
//! 持有一个轮次的全部任务：任务表、路径索引、待分配FIFO、处理中集合、
//! 完成/失败列表与处理量累计。待分配FIFO采用惰性删除：出队时跳过已经
//! 不在 pending 集合中的陈旧ID，避免O(n)的队列摘除。

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::Utc;
use tracing::debug;

use dispatchd_domain::{
    EnqueueOutcome, ProcessedTotals, ProcessingRecord, ProcessingReport, RoundId, RunStats,
    StoreSnapshot, Task, TaskCounts, TaskId, TaskPage, TaskStatus, Timestamp,
};
use dispatchd_errors::{DispatchError, DispatchResult};

use crate::node_stats::NodeStatsStore;

/// 巡检报告的Top-N条数
const INSPECT_TOP_N: usize = 5;

pub struct RoundStore {
    round_id: RoundId,
    tasks: HashMap<TaskId, Task>,
    path_index: HashMap<String, TaskId>,
    pending_queue: VecDeque<TaskId>,
    pending_set: HashSet<TaskId>,
    processing_set: HashSet<TaskId>,
    processing_started_at: HashMap<TaskId, Timestamp>,
    /// 头部为最近完成
    completed_list: Vec<TaskId>,
    completed_set: HashSet<TaskId>,
    /// 头部为最近失败
    failed_list: Vec<TaskId>,
    failed_set: HashSet<TaskId>,
    processed: ProcessedTotals,
}

impl RoundStore {
    pub fn new(round_id: RoundId) -> Self {
        Self {
            round_id,
            tasks: HashMap::new(),
            path_index: HashMap::new(),
            pending_queue: VecDeque::new(),
            pending_set: HashSet::new(),
            processing_set: HashSet::new(),
            processing_started_at: HashMap::new(),
            completed_list: Vec::new(),
            completed_set: HashSet::new(),
            failed_list: Vec::new(),
            failed_set: HashSet::new(),
            processed: ProcessedTotals::default(),
        }
    }

    pub fn round_id(&self) -> &str {
        &self.round_id
    }

    /// 批量入队路径
    ///
    /// 空白路径计入 skipped；同路径已存在且未失败的任务计入 skipped；
    /// 已失败的同路径任务会被整体移除后重新建新任务（旧ID随之消失）。
    pub fn enqueue<I>(&mut self, paths: I) -> EnqueueOutcome
    where
        I: IntoIterator<Item = String>,
    {
        let mut outcome = EnqueueOutcome::default();
        for raw in paths {
            let path = raw.trim();
            if path.is_empty() {
                outcome.skipped += 1;
                continue;
            }
            if let Some(existing_id) = self.path_index.get(path).cloned() {
                let replace = match self.tasks.get(&existing_id) {
                    Some(task) => task.status == TaskStatus::Failed,
                    None => true,
                };
                if !replace {
                    outcome.skipped += 1;
                    continue;
                }
                self.remove_task_entirely(&existing_id);
            }
            let task = Task::new(self.round_id.clone(), path.to_string());
            let id = task.id.clone();
            self.path_index.insert(path.to_string(), id.clone());
            self.tasks.insert(id.clone(), task);
            if self.pending_set.insert(id.clone()) {
                self.pending_queue.push_back(id.clone());
            }
            outcome.new_task_ids.push(id);
            outcome.added += 1;
        }
        outcome
    }

    /// 从待分配队列取出最多 `k` 个任务交给节点
    pub fn lease(
        &mut self,
        k: usize,
        node_id: Option<&str>,
        nodes: &mut NodeStatsStore,
    ) -> Vec<Task> {
        if let Some(node) = node_id {
            nodes.record_lease_request(node);
        }
        let mut leased = Vec::new();
        let now = Utc::now();
        while leased.len() < k {
            let Some(id) = self.pending_queue.pop_front() else {
                break;
            };
            // 惰性删除：跳过已被报告/清理的陈旧队列项
            if !self.pending_set.remove(&id) {
                continue;
            }
            let Some(task) = self.tasks.get_mut(&id) else {
                continue;
            };
            task.status = TaskStatus::Processing;
            task.processing_started_at = Some(now);
            task.updated_at = now;
            task.assigned_node = node_id.map(|n| n.to_string());
            self.processing_set.insert(id.clone());
            self.processing_started_at.insert(id.clone(), now);
            leased.push(task.clone());
        }
        if let Some(node) = node_id {
            if !leased.is_empty() {
                let ids: Vec<TaskId> = leased.iter().map(|t| t.id.clone()).collect();
                nodes.record_assignment(node, &ids);
            }
        }
        debug!("轮次 {} 分配 {} 个任务", self.round_id, leased.len());
        leased
    }

    /// 节点回报单个任务的终态
    ///
    /// 已完成的任务收到迟到的失败回报时保持完成不变（完成具有单调性）。
    pub fn report(
        &mut self,
        task_id: &str,
        success: bool,
        message: Option<String>,
        nodes: &mut NodeStatsStore,
    ) -> DispatchResult<TaskStatus> {
        if !self.tasks.contains_key(task_id) {
            return Err(DispatchError::task_not_found(task_id));
        }
        nodes.detach_task(task_id);
        self.processing_set.remove(task_id);
        self.processing_started_at.remove(task_id);
        self.pending_set.remove(task_id);

        let task = self.tasks.get_mut(task_id).expect("上面已检查存在");
        if task.status == TaskStatus::Completed && !success {
            return Ok(TaskStatus::Completed);
        }

        task.updated_at = Utc::now();
        task.message = message;
        task.assigned_node = None;
        task.processing_started_at = None;

        if success {
            task.status = TaskStatus::Completed;
            task.failure_count = 0;
            if self.failed_set.remove(task_id) {
                self.failed_list.retain(|id| id != task_id);
            }
            if self.completed_set.insert(task_id.to_string()) {
                self.completed_list.insert(0, task_id.to_string());
            }
            Ok(TaskStatus::Completed)
        } else {
            task.status = TaskStatus::Failed;
            task.failure_count += 1;
            if self.completed_set.remove(task_id) {
                self.completed_list.retain(|id| id != task_id);
            }
            self.failed_list.retain(|id| id != task_id);
            self.failed_list.insert(0, task_id.to_string());
            self.failed_set.insert(task_id.to_string());
            Ok(TaskStatus::Failed)
        }
    }

    /// 超时巡检
    ///
    /// 处理时长超过阈值的任务：首次超时退回待分配队列免费重试一次，
    /// 再次超时直接判失败。阈值 ≤ 0 时清扫全部处理中任务。
    pub fn sweep(&mut self, threshold_ms: i64, nodes: &mut NodeStatsStore) -> usize {
        let now = Utc::now();
        let expired: Vec<TaskId> = self
            .processing_started_at
            .iter()
            .filter(|(_, started)| {
                threshold_ms <= 0 || (now - **started).num_milliseconds() > threshold_ms
            })
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            nodes.detach_task(id);
            self.processing_set.remove(id);
            self.processing_started_at.remove(id);
            let Some(task) = self.tasks.get_mut(id) else {
                continue;
            };
            task.updated_at = now;
            task.assigned_node = None;
            task.processing_started_at = None;
            if task.failure_count == 0 {
                task.failure_count = 1;
                task.status = TaskStatus::Pending;
                task.message = Some("处理超时，已重新排队重试".to_string());
                if self.pending_set.insert(id.clone()) {
                    self.pending_queue.push_back(id.clone());
                }
            } else {
                task.failure_count += 1;
                task.status = TaskStatus::Failed;
                task.message = Some("处理超时次数已达上限".to_string());
                self.failed_list.retain(|fid| fid != id);
                self.failed_list.insert(0, id.clone());
                self.failed_set.insert(id.clone());
            }
        }
        if !expired.is_empty() {
            debug!("轮次 {} 清扫超时任务 {} 个", self.round_id, expired.len());
        }
        expired.len()
    }

    /// 巡检当前处理中任务，产出按时长降序的观测报告
    pub fn inspect(&self, threshold_ms: i64) -> ProcessingReport {
        let now = Utc::now();
        let mut records: Vec<ProcessingRecord> = self
            .processing_set
            .iter()
            .filter_map(|id| {
                let task = self.tasks.get(id)?;
                let started = self.processing_started_at.get(id).copied()?;
                let duration_ms = (now - started).num_milliseconds().max(0);
                Some(ProcessingRecord {
                    round_id: self.round_id.clone(),
                    task_id: id.clone(),
                    path: task.path.clone(),
                    status: task.status,
                    started_at: started,
                    duration_ms,
                    node_id: task.assigned_node.clone(),
                })
            })
            .collect();
        records.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));

        let timed_out: Vec<&ProcessingRecord> = records
            .iter()
            .filter(|r| r.duration_ms > threshold_ms)
            .collect();
        let near_timeout_count = if threshold_ms > 0 {
            let low = (threshold_ms as f64 * 0.8) as i64;
            records
                .iter()
                .filter(|r| r.duration_ms >= low && r.duration_ms <= threshold_ms)
                .count()
        } else {
            0
        };

        ProcessingReport {
            round_id: Some(self.round_id.clone()),
            total_processing: records.len(),
            timed_out_count: timed_out.len(),
            near_timeout_count,
            longest_duration_ms: records.first().map(|r| r.duration_ms),
            top_timed_out: timed_out.into_iter().take(INSPECT_TOP_N).cloned().collect(),
            top_longest: records.iter().take(INSPECT_TOP_N).cloned().collect(),
        }
    }

    /// 分页列出指定状态（或全部）的任务
    pub fn list(&self, status: Option<TaskStatus>, page: usize, page_size: usize) -> TaskPage {
        let ids: Vec<TaskId> = match status {
            Some(TaskStatus::Pending) => self
                .pending_queue
                .iter()
                .filter(|id| self.pending_set.contains(*id))
                .cloned()
                .collect(),
            Some(TaskStatus::Processing) => {
                let mut ids: Vec<TaskId> = self.processing_set.iter().cloned().collect();
                ids.sort_by(|a, b| {
                    let sa = self.processing_started_at.get(a);
                    let sb = self.processing_started_at.get(b);
                    sb.cmp(&sa)
                });
                ids
            }
            Some(TaskStatus::Completed) => self.completed_list.clone(),
            Some(TaskStatus::Failed) => self.failed_list.clone(),
            None => {
                let mut all: Vec<&Task> = self.tasks.values().collect();
                all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
                all.iter().map(|t| t.id.clone()).collect()
            }
        };

        let (page, page_size, start) = clamp_page(ids.len(), page, page_size);
        let tasks = ids
            .iter()
            .skip(start)
            .take(page_size)
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect();
        TaskPage {
            tasks,
            total: ids.len(),
            page,
            page_size,
        }
    }

    /// 先按任务ID、再按路径查找
    pub fn find(&self, query: &str) -> Option<Task> {
        if let Some(task) = self.tasks.get(query) {
            return Some(task.clone());
        }
        self.path_index
            .get(query)
            .and_then(|id| self.tasks.get(id))
            .cloned()
    }

    /// 按状态统计任务数（以任务表为准）
    pub fn counts(&self) -> TaskCounts {
        let mut counts = TaskCounts {
            total: self.tasks.len(),
            ..Default::default()
        };
        for task in self.tasks.values() {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Processing => counts.processing += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn pending_count(&self) -> usize {
        self.pending_set.len()
    }

    pub fn processing_count(&self) -> usize {
        self.processing_set.len()
    }

    pub fn processed(&self) -> ProcessedTotals {
        self.processed.clone()
    }

    pub fn add_processed(&mut self, item_num: u64, running_time: f64) {
        self.processed.add(item_num, running_time, Utc::now());
    }

    /// 失败任务（最近失败在前）
    pub fn failed_tasks(&self) -> Vec<Task> {
        self.failed_list
            .iter()
            .filter_map(|id| self.tasks.get(id).cloned())
            .collect()
    }

    /// 轮次运行统计
    pub fn run_stats(&self) -> RunStats {
        let counts = self.counts();
        let started_at = self.tasks.values().map(|t| t.created_at).min();
        let ended_at = self
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Completed)
            .map(|t| t.updated_at)
            .max();
        let duration_ms = match (started_at, ended_at) {
            (Some(start), Some(end)) if end >= start => Some((end - start).num_milliseconds()),
            _ => None,
        };
        let average_task_speed = duration_ms.and_then(|ms| {
            if ms > 0 {
                Some(counts.completed as f64 / (ms as f64 / 1000.0))
            } else {
                None
            }
        });
        let average_item_speed = if self.processed.total_running_time > 0.0 {
            Some(self.processed.total_item_num as f64 / self.processed.total_running_time)
        } else {
            None
        };
        let average_time_per_item = if self.processed.total_item_num > 0 {
            Some(self.processed.total_running_time / self.processed.total_item_num as f64)
        } else {
            None
        };
        RunStats {
            all_completed: counts.total > 0 && counts.completed == counts.total,
            average_time_per_100_items: average_time_per_item.map(|t| t * 100.0),
            average_time_per_item,
            average_item_speed,
            average_task_speed,
            duration_ms,
            started_at,
            ended_at,
            counts,
        }
    }

    /// 清空整个轮次：任务、队列与处理量累计全部归零
    pub fn clear(&mut self, nodes: &mut NodeStatsStore) -> usize {
        for id in self.tasks.keys() {
            nodes.detach_task(id);
        }
        let cleared = self.tasks.len();
        self.tasks.clear();
        self.path_index.clear();
        self.pending_queue.clear();
        self.pending_set.clear();
        self.processing_set.clear();
        self.processing_started_at.clear();
        self.completed_list.clear();
        self.completed_set.clear();
        self.failed_list.clear();
        self.failed_set.clear();
        self.processed = ProcessedTotals::default();
        cleared
    }

    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.keys().cloned().collect()
    }

    /// 导出持久化快照；队列与列表会过滤掉陈旧ID
    pub fn to_snapshot(&self) -> StoreSnapshot {
        let mut tasks: Vec<Task> = self.tasks.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        StoreSnapshot {
            round_id: self.round_id.clone(),
            tasks,
            pending_queue: self
                .pending_queue
                .iter()
                .filter(|id| self.pending_set.contains(*id))
                .cloned()
                .collect(),
            processing_started_at: self
                .processing_started_at
                .iter()
                .filter(|(id, _)| self.processing_set.contains(*id))
                .map(|(id, at)| (id.clone(), at.timestamp_millis()))
                .collect(),
            completed_list: self.completed_list.clone(),
            failed_list: self.failed_list.clone(),
            total_processed_item_num: self.processed.total_item_num,
            total_processed_running_time: self.processed.total_running_time,
            last_processed_at: self.processed.last_processed_at,
        }
    }

    /// 从快照恢复：以任务表为准重建索引与各集合
    pub fn from_snapshot(snapshot: StoreSnapshot) -> Self {
        let mut store = Self::new(snapshot.round_id.clone());
        store.processed = snapshot.processed_totals();

        for task in snapshot.tasks {
            // 路径索引优先指向未失败的任务
            match store.path_index.get(&task.path) {
                Some(existing) => {
                    let existing_failed = store
                        .tasks
                        .get(existing)
                        .map(|t| t.status == TaskStatus::Failed)
                        .unwrap_or(true);
                    if existing_failed && task.status != TaskStatus::Failed {
                        store.path_index.insert(task.path.clone(), task.id.clone());
                    }
                }
                None => {
                    store.path_index.insert(task.path.clone(), task.id.clone());
                }
            }
            match task.status {
                TaskStatus::Pending => {
                    store.pending_set.insert(task.id.clone());
                }
                TaskStatus::Processing => {
                    store.processing_set.insert(task.id.clone());
                }
                TaskStatus::Completed => {
                    store.completed_set.insert(task.id.clone());
                }
                TaskStatus::Failed => {
                    store.failed_set.insert(task.id.clone());
                }
            }
            store.tasks.insert(task.id.clone(), task);
        }

        // 按存活ID收敛队列，再补齐快照中缺失的成员
        let mut queued: HashSet<TaskId> = HashSet::new();
        for id in snapshot.pending_queue {
            if store.pending_set.contains(&id) && queued.insert(id.clone()) {
                store.pending_queue.push_back(id);
            }
        }
        for id in store.pending_set.iter() {
            if !queued.contains(id) {
                store.pending_queue.push_back(id.clone());
            }
        }

        for (id, ms) in snapshot.processing_started_at {
            if store.processing_set.contains(&id) {
                if let Some(at) = chrono::DateTime::from_timestamp_millis(ms) {
                    store.processing_started_at.insert(id, at);
                }
            }
        }
        for id in store.processing_set.clone() {
            if !store.processing_started_at.contains_key(&id) {
                let fallback = store
                    .tasks
                    .get(&id)
                    .map(|t| t.processing_started_at.unwrap_or(t.updated_at))
                    .unwrap_or_else(Utc::now);
                store.processing_started_at.insert(id, fallback);
            }
        }

        let mut seen: HashSet<TaskId> = HashSet::new();
        for id in snapshot.completed_list {
            if store.completed_set.contains(&id) && seen.insert(id.clone()) {
                store.completed_list.push(id);
            }
        }
        for id in store.completed_set.iter() {
            if !seen.contains(id) {
                store.completed_list.push(id.clone());
            }
        }

        let mut seen: HashSet<TaskId> = HashSet::new();
        for id in snapshot.failed_list {
            if store.failed_set.contains(&id) && seen.insert(id.clone()) {
                store.failed_list.push(id);
            }
        }
        for id in store.failed_set.iter() {
            if !seen.contains(id) {
                store.failed_list.push(id.clone());
            }
        }

        store
    }

    fn remove_task_entirely(&mut self, id: &TaskId) {
        if let Some(task) = self.tasks.remove(id) {
            if self.path_index.get(&task.path) == Some(id) {
                self.path_index.remove(&task.path);
            }
        }
        self.pending_set.remove(id);
        self.processing_set.remove(id);
        self.processing_started_at.remove(id);
        if self.completed_set.remove(id) {
            self.completed_list.retain(|cid| cid != id);
        }
        if self.failed_set.remove(id) {
            self.failed_list.retain(|fid| fid != id);
        }
    }
}

/// 分页参数收敛：页码与页宽最小为1，越界页码落到最后一页
fn clamp_page(total: usize, page: usize, page_size: usize) -> (usize, usize, usize) {
    let page_size = page_size.max(1);
    let last_page = total.div_ceil(page_size).max(1);
    let page = page.max(1).min(last_page);
    (page, page_size, (page - 1) * page_size)
}
