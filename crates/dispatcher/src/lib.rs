//! 调度核心
//!
//! 优先级队列、排序策略，以及扫描、后处理、报告三种调度器。

pub mod cron_utils;
pub mod kinds;
pub mod post_process_scheduler;
pub mod queue;
pub mod ranker;
pub mod registry;
pub mod report_scheduler;
pub mod scan_scheduler;
pub mod scheduler;

pub use kinds::SchedulerKind;
pub use post_process_scheduler::PostProcessScheduler;
pub use queue::{PriorityQueue, QueueDescription, QueueOptions};
pub use ranker::{DeadlineRanker, HistoryRanker, RankInput, Ranker};
pub use registry::SchedulerRegistry;
pub use report_scheduler::ReportScheduler;
pub use scan_scheduler::ScanScheduler;
pub use scheduler::{
    PushOptions, Recurrence, Scheduler, SchedulerContext, SchedulerDescription,
};
