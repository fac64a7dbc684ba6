//! 任务分发引擎
//!
//! 进程内的核心调度逻辑：轮次注册表、单轮任务状态机、批量分配、
//! 超时巡检（单次重试）、节点性能累计、轮次的冷热换入换出以及
//! 全局完成检测。

pub mod completion;
pub mod dispatcher;
pub mod node_stats;
pub mod round_store;
pub mod test_utils;

pub use completion::GlobalProgress;
pub use dispatcher::{DispatchConfig, Dispatcher, ImportOptions};
pub use node_stats::NodeStatsStore;
pub use round_store::RoundStore;
