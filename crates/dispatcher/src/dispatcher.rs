//! 调度器门面
//!
//! 进程级唯一入口：持有轮次注册表、活跃轮次指针、任务到轮次的路由索引、
//! 节点统计与运行时配置。所有状态都在一把粗粒度锁之内；持久化读写可以
//! 在锁内进行（足够短），Webhook推送则先在锁内取好文案、释放锁后再发送。
//!
//! 冷热策略：活跃轮次常驻内存；其余轮次按需加载，操作完成后若有脏数据
//! 或从未落盘则立即写快照并释放内存副本。轮次完成时总是落盘并释放。

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use dispatchd_domain::{
    format_round_id, parse_round_seq, DispatchConfigView, ConfigPatch, FailedTaskExport,
    FindResult, ImportResult, InspectResult, LeasedTask, NodePage, ProcessedTotals,
    ProcessingReport, ReportingState, RoundId, RoundMeta, RoundSnapshot, RoundStatus,
    RoundSummary, RunStats, SnapshotStore, SourceType, TaskId, TaskPage, TaskStatus, WebhookSink,
};
use dispatchd_errors::{DispatchError, DispatchResult};

use crate::completion::GlobalProgress;
use crate::node_stats::NodeStatsStore;
use crate::round_store::RoundStore;

/// 导出失败任务的默认条数上限
const DEFAULT_EXPORT_LIMIT: usize = 1000;

/// 运行时配置
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub default_batch_size: u32,
    pub max_batch_size: u32,
    pub feishu_webhook_url: Option<String>,
    pub feishu_report_interval_minutes: u32,
    /// 历史遗留配置项，超时重试固定为一次，不再参考该阈值
    pub task_failure_threshold: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_batch_size: 8,
            max_batch_size: 1000,
            feishu_webhook_url: None,
            feishu_report_interval_minutes: 240,
            task_failure_threshold: 3,
        }
    }
}

/// 导入选项
#[derive(Debug, Clone, Default)]
pub struct ImportOptions {
    pub name: Option<String>,
    pub source_type: SourceType,
    pub source_hint: Option<String>,
    /// 缺省时：当前没有活跃轮次且新轮次非空则自动激活
    pub activate: Option<bool>,
    /// 指定时向已有轮次追加路径
    pub round_id: Option<RoundId>,
}

struct RoundEntry {
    meta: RoundMeta,
    processed: ProcessedTotals,
    /// 热副本；冷轮次为 None
    store: Option<RoundStore>,
    dirty: bool,
    has_persisted: bool,
}

struct DispatcherState {
    /// 插入顺序的轮次ID
    order: Vec<RoundId>,
    rounds: HashMap<RoundId, RoundEntry>,
    /// 任务ID → 所属轮次，直达路由
    task_index: HashMap<TaskId, RoundId>,
    active_round: Option<RoundId>,
    next_seq: u32,
    nodes: NodeStatsStore,
    config: DispatchConfig,
    reporting: ReportingState,
    completion_digest: Option<String>,
}

pub struct Dispatcher {
    state: Mutex<DispatcherState>,
    snapshots: Arc<dyn SnapshotStore>,
    webhook: Arc<dyn WebhookSink>,
}

impl Dispatcher {
    /// 创建调度器并从快照存储恢复既有轮次
    ///
    /// 恢复的轮次全部以冷状态登记（计数影子 + 任务路由索引），
    /// 活跃指针由后续操作按插入顺序重新解析。
    pub async fn new(
        config: DispatchConfig,
        snapshots: Arc<dyn SnapshotStore>,
        webhook: Arc<dyn WebhookSink>,
    ) -> DispatchResult<Self> {
        let reporting = init_reporting(&config);
        let mut state = DispatcherState {
            order: Vec::new(),
            rounds: HashMap::new(),
            task_index: HashMap::new(),
            active_round: None,
            next_seq: 1,
            nodes: NodeStatsStore::new(),
            config,
            reporting,
            completion_digest: None,
        };

        let mut recovered: Vec<(u32, RoundId)> = Vec::new();
        for id in snapshots.list_ids().await? {
            match snapshots.read(&id).await {
                Ok(Some(snapshot)) => {
                    let seq = parse_round_seq(&id).unwrap_or(0);
                    for task in &snapshot.store.tasks {
                        state.task_index.insert(task.id.clone(), id.clone());
                    }
                    let mut meta = snapshot.metadata.clone();
                    // 重启后不保留活跃状态，由后续分配重新选择
                    if meta.status == RoundStatus::Active {
                        meta.status = RoundStatus::Pending;
                    }
                    let store = RoundStore::from_snapshot(snapshot.store);
                    meta.counts = store.counts();
                    let processed = store.processed();
                    state.rounds.insert(
                        id.clone(),
                        RoundEntry {
                            meta,
                            processed,
                            store: None,
                            dirty: false,
                            has_persisted: true,
                        },
                    );
                    state.next_seq = state.next_seq.max(seq + 1);
                    recovered.push((seq, id));
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("恢复轮次 {} 失败，跳过: {}", id, e);
                }
            }
        }
        recovered.sort();
        state.order = recovered.into_iter().map(|(_, id)| id).collect();
        if !state.order.is_empty() {
            info!("从快照存储恢复 {} 个轮次", state.order.len());
        }

        Ok(Self {
            state: Mutex::new(state),
            snapshots,
            webhook,
        })
    }

    /// 导入路径，新建轮次或向既有轮次追加
    pub async fn import(&self, paths: Vec<String>, opts: ImportOptions) -> DispatchResult<ImportResult> {
        let mut state = self.state.lock().await;
        let round_id = match &opts.round_id {
            Some(rid) => {
                let entry = state
                    .rounds
                    .get(rid)
                    .ok_or_else(|| DispatchError::round_not_found(rid))?;
                if entry.meta.status == RoundStatus::Completed {
                    return Err(DispatchError::round_completed(rid));
                }
                self.load_entry_store(&mut state, rid).await?;
                rid.clone()
            }
            None => {
                let id = format_round_id(state.next_seq);
                state.next_seq += 1;
                let mut meta =
                    RoundMeta::new(id.clone(), opts.name.clone(), opts.source_type, opts.source_hint.clone());
                let store = RoundStore::new(id.clone());
                meta.counts = store.counts();
                state.rounds.insert(
                    id.clone(),
                    RoundEntry {
                        meta,
                        processed: ProcessedTotals::default(),
                        store: Some(store),
                        dirty: true,
                        has_persisted: false,
                    },
                );
                state.order.push(id.clone());
                id
            }
        };

        let entry = state.rounds.get_mut(&round_id).expect("刚刚插入或已校验");
        let store = entry.store.as_mut().expect("已加载");
        let outcome = store.enqueue(paths);
        if outcome.added > 0 {
            entry.dirty = true;
        }
        refresh_entry(entry);
        for tid in &outcome.new_task_ids {
            state.task_index.insert(tid.clone(), round_id.clone());
        }
        info!(
            "轮次 {} 导入完成: 新增 {} 条，跳过 {} 条",
            round_id, outcome.added, outcome.skipped
        );

        let status = state.rounds.get(&round_id).expect("存在").meta.status;
        let should_activate = match opts.activate {
            Some(flag) => flag,
            None => !self.has_active_round(&state) && opts.round_id.is_none() && outcome.added > 0,
        };
        if should_activate && status != RoundStatus::Completed {
            self.activate_inner(&mut state, &round_id).await?;
        }
        self.settle_round(&mut state, &round_id).await;

        let entry = state.rounds.get(&round_id).expect("存在");
        let result = ImportResult {
            round_id: round_id.clone(),
            name: entry.meta.name.clone(),
            counts: entry.meta.counts,
            added: outcome.added,
            skipped: outcome.skipped,
            status: entry.meta.status,
        };

        let notice = self.check_completion(&mut state);
        drop(state);
        self.deliver(notice).await;
        Ok(result)
    }

    /// 把指定轮次切换为活跃轮次
    pub async fn set_active(&self, round_id: &str) -> DispatchResult<RoundSummary> {
        let mut state = self.state.lock().await;
        self.activate_inner(&mut state, round_id).await?;
        let entry = state.rounds.get(round_id).expect("激活成功则必然存在");
        Ok(RoundSummary {
            meta: entry.meta.clone(),
            processed: entry.processed.clone(),
        })
    }

    /// 批量领取任务
    ///
    /// 未指定轮次时优先从活跃轮次取；活跃轮次既无产出也无剩余待分配时，
    /// 按插入顺序向后补足缺口。一旦某轮次有产出或仍有剩余待分配即停止
    /// 继续向后扩散，首个产出任务的轮次成为新的活跃轮次。
    pub async fn lease(
        &self,
        batch_size: Option<u32>,
        round_id: Option<String>,
        node_id: Option<String>,
    ) -> DispatchResult<Vec<LeasedTask>> {
        let mut state = self.state.lock().await;
        let k = batch_size
            .unwrap_or(state.config.default_batch_size)
            .clamp(1, state.config.max_batch_size) as usize;
        let node = node_id.as_deref();
        let mut leased = Vec::new();

        if let Some(rid) = &round_id {
            if !state.rounds.contains_key(rid) {
                return Err(DispatchError::round_not_found(rid));
            }
            self.load_entry_store(&mut state, rid).await?;
            let st = &mut *state;
            let entry = st.rounds.get_mut(rid).expect("已加载");
            let got = entry
                .store
                .as_mut()
                .expect("已加载")
                .lease(k, node, &mut st.nodes);
            if !got.is_empty() {
                entry.dirty = true;
            }
            leased = got;
            self.settle_round(&mut state, rid).await;
        } else {
            let mut tried: HashSet<RoundId> = HashSet::new();
            let mut stop = false;

            if let Some(aid) = self.ensure_active(&mut state).await {
                let st = &mut *state;
                let entry = st.rounds.get_mut(&aid).expect("活跃轮次已加载");
                let store = entry.store.as_mut().expect("活跃轮次常驻内存");
                let got = store.lease(k, node, &mut st.nodes);
                let leftover = store.pending_count();
                if !got.is_empty() {
                    entry.dirty = true;
                }
                leased.extend(got);
                tried.insert(aid.clone());
                self.settle_round(&mut state, &aid).await;
                // 活跃轮次尚有工作时不向后续轮次扩散
                stop = !leased.is_empty() || leftover > 0;
            }

            if !stop {
                for rid in state.order.clone() {
                    if leased.len() >= k {
                        break;
                    }
                    if tried.contains(&rid) {
                        continue;
                    }
                    let Some(status) = state.rounds.get(&rid).map(|e| e.meta.status) else {
                        continue;
                    };
                    if status == RoundStatus::Completed {
                        continue;
                    }
                    if let Err(e) = self.load_entry_store(&mut state, &rid).await {
                        warn!("分配时加载轮次 {} 失败，跳过: {}", rid, e);
                        continue;
                    }
                    let st = &mut *state;
                    let entry = st.rounds.get_mut(&rid).expect("已加载");
                    let got = entry
                        .store
                        .as_mut()
                        .expect("已加载")
                        .lease(k - leased.len(), node, &mut st.nodes);
                    if got.is_empty() {
                        self.settle_round(&mut state, &rid).await;
                        continue;
                    }
                    entry.dirty = true;
                    leased.extend(got);
                    self.activate_inner(&mut state, &rid).await?;
                    self.settle_round(&mut state, &rid).await;
                    break;
                }
            }
        }

        debug!("本次分配 {} 个任务", leased.len());
        Ok(leased
            .into_iter()
            .map(|t| LeasedTask {
                task_id: t.id,
                round_id: t.round_id,
                path: t.path,
            })
            .collect())
    }

    /// 节点回报任务结果
    pub async fn report(
        &self,
        task_id: &str,
        success: bool,
        message: Option<String>,
    ) -> DispatchResult<TaskStatus> {
        let mut state = self.state.lock().await;
        let rid = state
            .task_index
            .get(task_id)
            .cloned()
            .ok_or_else(|| DispatchError::task_not_found(task_id))?;
        self.load_entry_store(&mut state, &rid).await?;
        let st = &mut *state;
        let entry = st.rounds.get_mut(&rid).expect("已加载");
        let status = entry
            .store
            .as_mut()
            .expect("已加载")
            .report(task_id, success, message, &mut st.nodes)?;
        entry.dirty = true;
        self.settle_round(&mut state, &rid).await;

        let notice = self.check_completion(&mut state);
        drop(state);
        self.deliver(notice).await;
        Ok(status)
    }

    /// 超时巡检；未指定轮次时清扫全部轮次
    pub async fn sweep(&self, threshold_ms: i64, round_id: Option<String>) -> DispatchResult<usize> {
        let mut state = self.state.lock().await;
        let explicit = round_id.is_some();
        let targets: Vec<RoundId> = match round_id {
            Some(rid) => {
                if !state.rounds.contains_key(&rid) {
                    return Err(DispatchError::round_not_found(&rid));
                }
                vec![rid]
            }
            None => state.order.clone(),
        };

        let mut touched = 0;
        for rid in targets {
            let processing = state
                .rounds
                .get(&rid)
                .map(|e| match &e.store {
                    Some(store) => store.processing_count(),
                    None => e.meta.counts.processing,
                })
                .unwrap_or(0);
            if processing == 0 {
                continue;
            }
            if let Err(e) = self.load_entry_store(&mut state, &rid).await {
                if explicit {
                    return Err(e);
                }
                warn!("巡检时加载轮次 {} 失败，跳过: {}", rid, e);
                continue;
            }
            let st = &mut *state;
            let entry = st.rounds.get_mut(&rid).expect("已加载");
            let n = entry
                .store
                .as_mut()
                .expect("已加载")
                .sweep(threshold_ms, &mut st.nodes);
            if n > 0 {
                entry.dirty = true;
                touched += n;
            }
            self.settle_round(&mut state, &rid).await;
        }

        if touched > 0 {
            info!("超时巡检处理 {} 个任务", touched);
        }
        let notice = self.check_completion(&mut state);
        drop(state);
        self.deliver(notice).await;
        Ok(touched)
    }

    /// 处理中任务巡检报告
    pub async fn inspect(
        &self,
        threshold_ms: i64,
        round_id: Option<String>,
    ) -> DispatchResult<InspectResult> {
        let mut state = self.state.lock().await;
        if let Some(rid) = &round_id {
            if !state.rounds.contains_key(rid) {
                return Err(DispatchError::round_not_found(rid));
            }
        }

        let mut aggregate = ProcessingReport::default();
        let mut selected = None;
        let mut all_timed_out = Vec::new();
        let mut all_longest = Vec::new();

        for rid in state.order.clone() {
            let is_selected = round_id.as_deref() == Some(rid.as_str());
            let processing = state
                .rounds
                .get(&rid)
                .map(|e| match &e.store {
                    Some(store) => store.processing_count(),
                    None => e.meta.counts.processing,
                })
                .unwrap_or(0);
            if processing == 0 && !is_selected {
                continue;
            }
            if let Err(e) = self.load_entry_store(&mut state, &rid).await {
                if is_selected {
                    return Err(e);
                }
                warn!("巡检时加载轮次 {} 失败，跳过: {}", rid, e);
                continue;
            }
            let report = state
                .rounds
                .get(&rid)
                .and_then(|e| e.store.as_ref())
                .expect("已加载")
                .inspect(threshold_ms);
            aggregate.total_processing += report.total_processing;
            aggregate.timed_out_count += report.timed_out_count;
            aggregate.near_timeout_count += report.near_timeout_count;
            aggregate.longest_duration_ms =
                match (aggregate.longest_duration_ms, report.longest_duration_ms) {
                    (Some(a), Some(b)) => Some(a.max(b)),
                    (a, b) => a.or(b),
                };
            all_timed_out.extend(report.top_timed_out.iter().cloned());
            all_longest.extend(report.top_longest.iter().cloned());
            if is_selected {
                selected = Some(report);
            }
            self.settle_round(&mut state, &rid).await;
        }

        all_timed_out.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        all_longest.sort_by(|a, b| b.duration_ms.cmp(&a.duration_ms));
        all_timed_out.truncate(5);
        all_longest.truncate(5);
        aggregate.top_timed_out = all_timed_out;
        aggregate.top_longest = all_longest;

        if let Some(rid) = &round_id {
            if selected.is_none() {
                selected = Some(ProcessingReport {
                    round_id: Some(rid.clone()),
                    ..Default::default()
                });
            }
        }
        Ok(InspectResult {
            aggregate,
            selected_round: selected,
        })
    }

    /// 分页列出任务；未指定轮次时取活跃轮次
    pub async fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        page: usize,
        page_size: usize,
        round_id: Option<String>,
    ) -> DispatchResult<TaskPage> {
        let mut state = self.state.lock().await;
        let rid = match round_id {
            Some(rid) => {
                if !state.rounds.contains_key(&rid) {
                    return Err(DispatchError::round_not_found(&rid));
                }
                rid
            }
            None => match self.ensure_active(&mut state).await {
                Some(rid) => rid,
                None => {
                    return Ok(TaskPage {
                        tasks: Vec::new(),
                        total: 0,
                        page: 1,
                        page_size: page_size.max(1),
                    })
                }
            },
        };
        self.load_entry_store(&mut state, &rid).await?;
        let page = state
            .rounds
            .get(&rid)
            .and_then(|e| e.store.as_ref())
            .expect("已加载")
            .list(status, page, page_size);
        self.settle_round(&mut state, &rid).await;
        Ok(page)
    }

    /// 按插入顺序列出全部轮次摘要
    pub async fn list_rounds(&self) -> Vec<RoundSummary> {
        let mut state = self.state.lock().await;
        for entry in state.rounds.values_mut() {
            refresh_entry(entry);
        }
        state
            .order
            .iter()
            .filter_map(|id| state.rounds.get(id))
            .map(|entry| RoundSummary {
                meta: entry.meta.clone(),
                processed: entry.processed.clone(),
            })
            .collect()
    }

    /// 轮次运行统计；未指定轮次时取活跃轮次
    pub async fn round_stats(&self, round_id: Option<String>) -> DispatchResult<RunStats> {
        let mut state = self.state.lock().await;
        let rid = match round_id {
            Some(rid) => {
                if !state.rounds.contains_key(&rid) {
                    return Err(DispatchError::round_not_found(&rid));
                }
                rid
            }
            None => self
                .ensure_active(&mut state)
                .await
                .ok_or(DispatchError::NoActiveRound)?,
        };
        self.load_entry_store(&mut state, &rid).await?;
        let stats = state
            .rounds
            .get(&rid)
            .and_then(|e| e.store.as_ref())
            .expect("已加载")
            .run_stats();
        self.settle_round(&mut state, &rid).await;
        Ok(stats)
    }

    /// 按任务ID或路径查找任务
    pub async fn find_task(
        &self,
        query: &str,
        round_id: Option<String>,
    ) -> DispatchResult<Option<FindResult>> {
        let mut state = self.state.lock().await;
        if let Some(rid) = round_id {
            if !state.rounds.contains_key(&rid) {
                return Err(DispatchError::round_not_found(&rid));
            }
            self.load_entry_store(&mut state, &rid).await?;
            let found = state
                .rounds
                .get(&rid)
                .and_then(|e| e.store.as_ref())
                .expect("已加载")
                .find(query);
            self.settle_round(&mut state, &rid).await;
            return Ok(found.map(|task| FindResult {
                round_id: rid,
                task,
            }));
        }

        // 先走任务ID直达索引，再全局按路径查
        if let Some(rid) = state.task_index.get(query).cloned() {
            self.load_entry_store(&mut state, &rid).await?;
            let found = state
                .rounds
                .get(&rid)
                .and_then(|e| e.store.as_ref())
                .expect("已加载")
                .find(query);
            self.settle_round(&mut state, &rid).await;
            return Ok(found.map(|task| FindResult {
                round_id: rid,
                task,
            }));
        }

        for rid in state.order.clone() {
            if self.load_entry_store(&mut state, &rid).await.is_err() {
                continue;
            }
            let found = state
                .rounds
                .get(&rid)
                .and_then(|e| e.store.as_ref())
                .expect("已加载")
                .find(query);
            self.settle_round(&mut state, &rid).await;
            if let Some(task) = found {
                return Ok(Some(FindResult {
                    round_id: rid,
                    task,
                }));
            }
        }
        Ok(None)
    }

    /// 记录节点处理量
    ///
    /// 节点统计是全局的；存在活跃轮次时同步累计到该轮次的处理量。
    /// 没有活跃轮次时仅更新节点统计，不视为错误。
    pub async fn record_processed(
        &self,
        node_id: &str,
        item_num: u64,
        running_time: f64,
    ) -> DispatchResult<()> {
        if node_id.trim().is_empty() {
            return Err(DispatchError::invalid_input("nodeId 不能为空"));
        }
        if !running_time.is_finite() || running_time < 0.0 {
            return Err(DispatchError::invalid_input("runningTime 必须是非负数"));
        }

        let mut state = self.state.lock().await;
        state.nodes.record_processed(node_id, item_num, running_time);

        let active = state
            .active_round
            .clone()
            .filter(|rid| self.has_active_round(&state) && state.rounds.contains_key(rid));
        if let Some(rid) = active {
            if state.rounds.get(&rid).map(|e| e.store.is_none()).unwrap_or(false) {
                self.load_entry_store(&mut state, &rid).await?;
            }
            let entry = state.rounds.get_mut(&rid).expect("已校验");
            if let Some(store) = entry.store.as_mut() {
                store.add_processed(item_num, running_time);
                entry.dirty = true;
                entry.processed = store.processed();
            }
        }
        Ok(())
    }

    /// 分页列出节点统计
    pub async fn list_nodes(&self, page: usize, page_size: usize) -> NodePage {
        let mut state = self.state.lock().await;
        state.nodes.list(page, page_size)
    }

    /// 删除节点记录
    pub async fn delete_node(&self, node_id: &str) -> bool {
        let mut state = self.state.lock().await;
        state.nodes.delete(node_id)
    }

    /// 清空全部节点统计
    pub async fn clear_nodes(&self) {
        let mut state = self.state.lock().await;
        state.nodes.clear();
    }

    /// 清除一个轮次及其持久化快照
    pub async fn clear_round(&self, round_id: &str) -> DispatchResult<usize> {
        let mut state = self.state.lock().await;
        if !state.rounds.contains_key(round_id) {
            return Err(DispatchError::round_not_found(round_id));
        }
        let cleared = self.remove_round(&mut state, round_id).await;
        if state.rounds.is_empty() {
            state.completion_digest = None;
        }
        let notice = self.check_completion(&mut state);
        drop(state);
        self.deliver(notice).await;
        Ok(cleared)
    }

    /// 清除全部轮次
    pub async fn clear_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for rid in state.order.clone() {
            cleared += self.remove_round(&mut state, &rid).await;
        }
        state.completion_digest = None;
        info!("已清除全部轮次，共 {} 个任务", cleared);
        cleared
    }

    /// 当前运行时配置视图
    pub async fn get_config(&self) -> DispatchConfigView {
        let state = self.state.lock().await;
        config_view(&state)
    }

    /// 增量更新运行时配置
    pub async fn update_config(&self, patch: ConfigPatch) -> DispatchResult<DispatchConfigView> {
        let mut state = self.state.lock().await;
        let mut config = state.config.clone();

        if let Some(v) = patch.default_batch_size {
            if v == 0 {
                return Err(DispatchError::invalid_input("defaultBatchSize 必须大于 0"));
            }
            config.default_batch_size = v;
        }
        if let Some(v) = patch.max_batch_size {
            if v == 0 {
                return Err(DispatchError::invalid_input("maxBatchSize 必须大于 0"));
            }
            config.max_batch_size = v;
        }
        if config.default_batch_size > config.max_batch_size {
            return Err(DispatchError::invalid_input(
                "defaultBatchSize 不能超过 maxBatchSize",
            ));
        }
        let mut reporting_changed = false;
        if let Some(url) = &patch.feishu_webhook_url {
            if let Some(url) = url {
                if !url.starts_with("https://") {
                    return Err(DispatchError::invalid_input("Webhook地址必须以 https:// 开头"));
                }
            }
            config.feishu_webhook_url = url.clone();
            reporting_changed = true;
        }
        if let Some(v) = patch.feishu_report_interval_minutes {
            config.feishu_report_interval_minutes = v;
            reporting_changed = true;
        }
        if let Some(v) = patch.task_failure_threshold {
            config.task_failure_threshold = v;
        }

        state.config = config;
        if reporting_changed {
            let next = init_reporting(&state.config);
            state.reporting.reporting_enabled = next.reporting_enabled;
            state.reporting.next_report_at = next.next_report_at;
            info!("汇报配置已更新");
        }
        Ok(config_view(&state))
    }

    /// 手动触发一次进度汇报
    ///
    /// 手动触发不改动完成摘要，自动完成通报的边沿判定不受影响。
    pub async fn trigger_report(&self) -> DispatchResult<()> {
        let (url, text) = {
            let mut state = self.state.lock().await;
            let url = state
                .config
                .feishu_webhook_url
                .clone()
                .ok_or(DispatchError::NoWebhook)?;
            if !state.reporting.reporting_enabled {
                return Err(DispatchError::ReportingDisabled);
            }
            if state.reporting.in_flight {
                return Err(DispatchError::ReportInFlight);
            }
            state.reporting.in_flight = true;
            let progress = self.collect_progress(&state);
            (url, progress.render_progress_text())
        };

        let result = self.webhook.post_text(&url, &text).await;

        let mut state = self.state.lock().await;
        state.reporting.in_flight = false;
        match result {
            Ok(()) => {
                let now = Utc::now();
                state.reporting.last_report_at = Some(now);
                state.reporting.next_report_at = Some(
                    now + chrono::Duration::minutes(
                        state.config.feishu_report_interval_minutes as i64,
                    ),
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 周期性汇报检查；由外部定时器驱动，到点则发送一次进度汇报
    pub async fn maybe_periodic_report(&self) -> bool {
        let (url, text) = {
            let mut state = self.state.lock().await;
            if !state.reporting.reporting_enabled || state.reporting.in_flight {
                return false;
            }
            let Some(url) = state.config.feishu_webhook_url.clone() else {
                return false;
            };
            let now = Utc::now();
            let due = state
                .reporting
                .next_report_at
                .map(|at| now >= at)
                .unwrap_or(false);
            if !due {
                return false;
            }
            state.reporting.in_flight = true;
            let progress = self.collect_progress(&state);
            (url, progress.render_progress_text())
        };

        let result = self.webhook.post_text(&url, &text).await;

        let mut state = self.state.lock().await;
        state.reporting.in_flight = false;
        let now = Utc::now();
        // 失败也推进下次汇报时间，避免对故障Webhook持续重发
        state.reporting.next_report_at = Some(
            now + chrono::Duration::minutes(state.config.feishu_report_interval_minutes as i64),
        );
        match result {
            Ok(()) => {
                state.reporting.last_report_at = Some(now);
                true
            }
            Err(e) => {
                warn!("定时汇报发送失败: {}", e);
                false
            }
        }
    }

    /// 导出失败任务
    pub async fn export_failed(
        &self,
        round_id: Option<String>,
        limit: Option<usize>,
    ) -> DispatchResult<Vec<FailedTaskExport>> {
        let mut state = self.state.lock().await;
        let explicit = round_id.is_some();
        let targets: Vec<RoundId> = match round_id {
            Some(rid) => {
                if !state.rounds.contains_key(&rid) {
                    return Err(DispatchError::round_not_found(&rid));
                }
                vec![rid]
            }
            None => state.order.clone(),
        };
        let limit = limit.unwrap_or(DEFAULT_EXPORT_LIMIT).max(1);

        let mut exports = Vec::new();
        for rid in targets {
            if exports.len() >= limit {
                break;
            }
            let failed = state
                .rounds
                .get(&rid)
                .map(|e| e.meta.counts.failed)
                .unwrap_or(0);
            if failed == 0 {
                continue;
            }
            if let Err(e) = self.load_entry_store(&mut state, &rid).await {
                if explicit {
                    return Err(e);
                }
                warn!("导出失败任务时加载轮次 {} 失败，跳过: {}", rid, e);
                continue;
            }
            let tasks = state
                .rounds
                .get(&rid)
                .and_then(|e| e.store.as_ref())
                .expect("已加载")
                .failed_tasks();
            for task in tasks {
                if exports.len() >= limit {
                    break;
                }
                exports.push(FailedTaskExport {
                    round_id: rid.clone(),
                    id: task.id,
                    path: task.path,
                    failure_count: task.failure_count,
                    message: task.message,
                    created_at: task.created_at,
                    updated_at: task.updated_at,
                });
            }
            self.settle_round(&mut state, &rid).await;
        }
        Ok(exports)
    }

    /// 当前完成摘要（已触发的最后一次）
    pub async fn completion_digest(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.completion_digest.clone()
    }

    /// 把所有热轮次落盘（优雅关闭时调用）
    pub async fn flush_all(&self) {
        let mut state = self.state.lock().await;
        for rid in state.order.clone() {
            let needs_flush = state
                .rounds
                .get(&rid)
                .map(|e| e.store.is_some() && (e.dirty || !e.has_persisted))
                .unwrap_or(false);
            if needs_flush {
                self.flush_entry(&mut state, &rid).await;
            }
        }
    }

    // ------------------------------------------------------------------
    // 内部辅助
    // ------------------------------------------------------------------

    /// 按需加载轮次的热副本
    async fn load_entry_store(&self, state: &mut DispatcherState, id: &str) -> DispatchResult<()> {
        let entry = state
            .rounds
            .get(id)
            .ok_or_else(|| DispatchError::round_not_found(id))?;
        if entry.store.is_some() {
            return Ok(());
        }
        match self.snapshots.read(id).await {
            Ok(Some(snapshot)) => {
                let store = RoundStore::from_snapshot(snapshot.store);
                let entry = state.rounds.get_mut(id).expect("已校验");
                entry.store = Some(store);
                debug!("轮次 {} 已加载为热副本", id);
                Ok(())
            }
            Ok(None) => Err(DispatchError::round_unavailable(id, "快照缺失")),
            Err(e) => Err(DispatchError::round_unavailable(id, e.to_string())),
        }
    }

    /// 操作后的收尾：刷新影子、按冷热策略落盘并释放内存副本
    async fn settle_round(&self, state: &mut DispatcherState, id: &str) {
        let (completed, has_store, needs_flush) = {
            let Some(entry) = state.rounds.get_mut(id) else {
                return;
            };
            refresh_entry(entry);
            (
                entry.meta.status == RoundStatus::Completed,
                entry.store.is_some(),
                entry.dirty || !entry.has_persisted,
            )
        };
        if completed && state.active_round.as_deref() == Some(id) {
            state.active_round = None;
        }
        if !has_store {
            return;
        }
        let is_active = state.active_round.as_deref() == Some(id);
        if completed || !is_active {
            if needs_flush {
                self.flush_entry(state, id).await;
            }
            if let Some(entry) = state.rounds.get_mut(id) {
                // 写失败的轮次保持热与脏，内存数据不丢
                if !entry.dirty && entry.has_persisted {
                    entry.store = None;
                }
            }
        }
    }

    /// 写出一个轮次的快照
    async fn flush_entry(&self, state: &mut DispatcherState, id: &str) {
        let snapshot = {
            let Some(entry) = state.rounds.get(id) else {
                return;
            };
            let Some(store) = &entry.store else {
                return;
            };
            RoundSnapshot {
                metadata: entry.meta.clone(),
                store: store.to_snapshot(),
            }
        };
        match self.snapshots.write(&snapshot).await {
            Ok(()) => {
                if let Some(entry) = state.rounds.get_mut(id) {
                    entry.dirty = false;
                    entry.has_persisted = true;
                }
            }
            Err(e) => {
                error!("轮次 {} 快照写入失败，保留内存副本: {}", id, e);
            }
        }
    }

    /// 当前活跃指针是否指向一个有效的未完成轮次
    fn has_active_round(&self, state: &DispatcherState) -> bool {
        state
            .active_round
            .as_ref()
            .and_then(|id| state.rounds.get(id))
            .map(|e| e.meta.status != RoundStatus::Completed)
            .unwrap_or(false)
    }

    /// 解析活跃轮次：指针有效则直接返回，否则按插入顺序促升首个未完成轮次
    async fn ensure_active(&self, state: &mut DispatcherState) -> Option<RoundId> {
        if let Some(id) = state.active_round.clone() {
            let valid = state
                .rounds
                .get(&id)
                .map(|e| e.meta.status != RoundStatus::Completed)
                .unwrap_or(false);
            if valid {
                if self.load_entry_store(state, &id).await.is_ok() {
                    return Some(id);
                }
                warn!("活跃轮次 {} 加载失败", id);
            }
            state.active_round = None;
        }
        for id in state.order.clone() {
            let Some(status) = state.rounds.get(&id).map(|e| e.meta.status) else {
                continue;
            };
            if status == RoundStatus::Completed {
                continue;
            }
            if let Err(e) = self.load_entry_store(state, &id).await {
                warn!("促升轮次 {} 失败，跳过: {}", id, e);
                continue;
            }
            let entry = state.rounds.get_mut(&id).expect("已加载");
            mark_active(entry);
            state.active_round = Some(id.clone());
            return Some(id);
        }
        None
    }

    /// 激活指定轮次，必要时降级原活跃轮次
    async fn activate_inner(&self, state: &mut DispatcherState, id: &str) -> DispatchResult<()> {
        let entry = state
            .rounds
            .get(id)
            .ok_or_else(|| DispatchError::round_not_found(id))?;
        if entry.meta.status == RoundStatus::Completed {
            return Err(DispatchError::round_completed(id));
        }
        if state.active_round.as_deref() == Some(id) {
            self.load_entry_store(state, id).await?;
            return Ok(());
        }

        if let Some(prev) = state.active_round.take() {
            if let Some(prev_entry) = state.rounds.get_mut(&prev) {
                refresh_entry(prev_entry);
                // 没有剩余工作时 refresh 已置为完成；否则退回待命
                if prev_entry.meta.status == RoundStatus::Active {
                    prev_entry.meta.status = RoundStatus::Pending;
                    prev_entry.dirty = true;
                }
            }
            self.settle_round(state, &prev).await;
            info!("轮次 {} 让出活跃位", prev);
        }

        self.load_entry_store(state, id).await?;
        let entry = state.rounds.get_mut(id).expect("已加载");
        mark_active(entry);
        state.active_round = Some(id.to_string());
        info!("轮次 {} 成为活跃轮次", id);
        Ok(())
    }

    /// 移除一个轮次：任务、节点关联、路由索引与持久化快照
    async fn remove_round(&self, state: &mut DispatcherState, id: &str) -> usize {
        let cleared = state
            .rounds
            .get(id)
            .map(|e| match &e.store {
                Some(store) => store.counts().total,
                None => e.meta.counts.total,
            })
            .unwrap_or(0);

        let task_ids: Vec<TaskId> = state
            .task_index
            .iter()
            .filter(|(_, owner)| owner.as_str() == id)
            .map(|(tid, _)| tid.clone())
            .collect();
        for tid in &task_ids {
            state.nodes.detach_task(tid);
            state.task_index.remove(tid);
        }

        state.rounds.remove(id);
        state.order.retain(|rid| rid != id);
        if state.active_round.as_deref() == Some(id) {
            state.active_round = None;
        }
        if let Err(e) = self.snapshots.delete(id).await {
            warn!("删除轮次 {} 的快照失败: {}", id, e);
        }
        info!("轮次 {} 已清除，共 {} 个任务", id, cleared);
        cleared
    }

    fn collect_progress(&self, state: &DispatcherState) -> GlobalProgress {
        GlobalProgress::collect(
            state
                .order
                .iter()
                .filter_map(|id| state.rounds.get(id))
                .map(|e| (&e.meta, &e.processed)),
        )
    }

    /// 完成边沿检测；需要发送通报时返回（地址, 文案），由调用方释放锁后发送
    fn check_completion(&self, state: &mut DispatcherState) -> Option<(String, String)> {
        let progress = self.collect_progress(state);
        if progress.all_completed() {
            let digest = progress.digest();
            if state.completion_digest.as_deref() != Some(digest.as_str()) {
                state.completion_digest = Some(digest);
                match &state.config.feishu_webhook_url {
                    Some(url) => {
                        return Some((url.clone(), progress.render_completion_text()));
                    }
                    None => {
                        debug!("未配置Webhook，跳过完成通报");
                    }
                }
            }
        } else {
            // 条件被打破后清空摘要，下一次完成边沿重新触发
            state.completion_digest = None;
        }
        None
    }

    async fn deliver(&self, notice: Option<(String, String)>) {
        if let Some((url, text)) = notice {
            match self.webhook.post_text(&url, &text).await {
                Ok(()) => info!("完成通报已发送"),
                Err(e) => error!("完成通报发送失败: {}", e),
            }
        }
    }
}

fn mark_active(entry: &mut RoundEntry) {
    if entry.meta.status != RoundStatus::Active {
        entry.meta.status = RoundStatus::Active;
        if entry.meta.activated_at.is_none() {
            entry.meta.activated_at = Some(Utc::now());
        }
        entry.dirty = true;
    }
}

/// 用热副本刷新影子计数，并按 R1 收敛生命周期
fn refresh_entry(entry: &mut RoundEntry) {
    let Some(store) = &entry.store else {
        return;
    };
    entry.meta.counts = store.counts();
    entry.processed = store.processed();
    if entry.meta.counts.is_complete() && entry.meta.status != RoundStatus::Completed {
        entry.meta.status = RoundStatus::Completed;
        entry.meta.completed_at = Some(Utc::now());
        entry.dirty = true;
        info!("轮次 {} 已全部完成", entry.meta.id);
    }
}

fn init_reporting(config: &DispatchConfig) -> ReportingState {
    let enabled = config.feishu_report_interval_minutes > 0;
    ReportingState {
        last_report_at: None,
        next_report_at: if enabled && config.feishu_webhook_url.is_some() {
            Some(Utc::now() + chrono::Duration::minutes(config.feishu_report_interval_minutes as i64))
        } else {
            None
        },
        reporting_enabled: enabled,
        in_flight: false,
    }
}

fn config_view(state: &DispatcherState) -> DispatchConfigView {
    DispatchConfigView {
        default_batch_size: state.config.default_batch_size,
        max_batch_size: state.config.max_batch_size,
        feishu_webhook_url: state.config.feishu_webhook_url.clone(),
        feishu_report_interval_minutes: state.config.feishu_report_interval_minutes,
        task_failure_threshold: state.config.task_failure_threshold,
        reporting: state.reporting.clone(),
    }
}
