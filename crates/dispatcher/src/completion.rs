//! 全局完成检测与通报文案
//!
//! 汇总所有轮次的影子计数得到全局进度，序列化为规范摘要串。摘要串与
//! 上次触发时不同且所有轮次均已完成时，恰好触发一次Webhook通报。

use dispatchd_domain::{ProcessedTotals, RoundMeta, RoundStatus};

/// 全局进度汇总
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalProgress {
    pub total_rounds: usize,
    pub completed_rounds: usize,
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub total_items: u64,
    pub total_running_time: f64,
}

impl GlobalProgress {
    pub fn collect<'a, I>(entries: I) -> Self
    where
        I: Iterator<Item = (&'a RoundMeta, &'a ProcessedTotals)>,
    {
        let mut progress = GlobalProgress::default();
        for (meta, processed) in entries {
            progress.total_rounds += 1;
            if meta.status == RoundStatus::Completed {
                progress.completed_rounds += 1;
            }
            progress.total_tasks += meta.counts.total;
            progress.completed_tasks += meta.counts.completed;
            progress.failed_tasks += meta.counts.failed;
            progress.total_items += processed.total_item_num;
            progress.total_running_time += processed.total_running_time;
        }
        progress
    }

    /// 所有轮次完成且至少存在一个轮次
    pub fn all_completed(&self) -> bool {
        self.total_rounds >= 1 && self.completed_rounds == self.total_rounds
    }

    /// 规范化摘要串，作为完成边沿的判定依据
    pub fn digest(&self) -> String {
        serde_json::json!({
            "totalRounds": self.total_rounds,
            "completedRounds": self.completed_rounds,
            "totalTasks": self.total_tasks,
            "completedTasks": self.completed_tasks,
            "failedTasks": self.failed_tasks,
            "roundedItems": self.total_items,
            "roundedRunningTime": self.total_running_time.round() as i64,
        })
        .to_string()
    }

    /// 全部完成时的通报文案
    pub fn render_completion_text(&self) -> String {
        let mut lines = vec![
            "📣 全部任务轮次已完成".to_string(),
            format!("轮次: {}/{} 个完成", self.completed_rounds, self.total_rounds),
            format!(
                "任务: 共 {} 个，成功 {} 个，失败 {} 个",
                self.total_tasks, self.completed_tasks, self.failed_tasks
            ),
            format!("累计处理条目: {}", self.total_items),
            format!("累计运行时长: {:.1} 秒", self.total_running_time),
        ];
        self.append_averages(&mut lines);
        lines.join("\n")
    }

    /// 定时/手动汇报的进度文案
    pub fn render_progress_text(&self) -> String {
        let mut lines = vec![
            "📊 任务进度通报".to_string(),
            format!("轮次: {}/{} 个完成", self.completed_rounds, self.total_rounds),
            format!(
                "任务: 共 {} 个，成功 {} 个，失败 {} 个",
                self.total_tasks, self.completed_tasks, self.failed_tasks
            ),
            format!("累计处理条目: {}", self.total_items),
            format!("累计运行时长: {:.1} 秒", self.total_running_time),
        ];
        self.append_averages(&mut lines);
        lines.join("\n")
    }

    fn append_averages(&self, lines: &mut Vec<String>) {
        if self.total_running_time > 0.0 {
            lines.push(format!(
                "平均速度: {:.2} 条/秒",
                self.total_items as f64 / self.total_running_time
            ));
        }
        if self.total_items > 0 {
            lines.push(format!(
                "平均每100条耗时: {:.1} 秒",
                self.total_running_time / self.total_items as f64 * 100.0
            ));
        }
    }
}
