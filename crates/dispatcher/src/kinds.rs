//! 调度器种类
//!
//! 种类集合在编译期固定，统一通过 [`SchedulerKind`] 分发生命周期操作。

use std::sync::Arc;

use scheduler_core::SchedulerResult;
use scheduler_domain::{FilterRequest, PrioritizedItem, Task, TaskType};

use crate::post_process_scheduler::PostProcessScheduler;
use crate::report_scheduler::ReportScheduler;
use crate::scan_scheduler::ScanScheduler;
use crate::scheduler::{PushOptions, Scheduler, SchedulerDescription};

#[derive(Clone)]
pub enum SchedulerKind {
    Scan(Arc<ScanScheduler>),
    PostProcess(Arc<PostProcessScheduler>),
    Report(Arc<ReportScheduler>),
}

impl SchedulerKind {
    pub fn base(&self) -> &Scheduler {
        match self {
            SchedulerKind::Scan(s) => s.base(),
            SchedulerKind::PostProcess(s) => s.base(),
            SchedulerKind::Report(s) => s.base(),
        }
    }

    pub fn id(&self) -> &str {
        self.base().id()
    }

    pub fn organisation(&self) -> &str {
        self.base().organisation()
    }

    pub fn task_type(&self) -> TaskType {
        self.base().queue().item_type()
    }

    pub fn is_enabled(&self) -> bool {
        self.base().is_enabled()
    }

    /// 启动后台循环
    pub async fn run(&self) {
        match self {
            SchedulerKind::Scan(s) => s.run().await,
            SchedulerKind::PostProcess(s) => s.run().await,
            SchedulerKind::Report(s) => s.run().await,
        }
    }

    pub async fn enable(&self) {
        match self {
            SchedulerKind::Scan(s) => s.enable().await,
            SchedulerKind::PostProcess(s) => s.enable().await,
            SchedulerKind::Report(s) => s.enable().await,
        }
    }

    pub async fn disable(&self) -> SchedulerResult<()> {
        self.base().disable().await
    }

    /// 只停止循环，保留队列内容
    pub async fn stop(&self) {
        self.base().stop().await
    }

    pub async fn push_item_to_queue(&self, item: PrioritizedItem) -> SchedulerResult<Task> {
        self.base()
            .push_item_to_queue(item, PushOptions::default())
            .await
    }

    pub async fn pop_item_from_queue(
        &self,
        filters: Option<&FilterRequest>,
        limit: i64,
    ) -> SchedulerResult<Vec<Task>> {
        self.base().pop_item_from_queue(filters, limit).await
    }

    pub async fn describe(&self) -> SchedulerResult<SchedulerDescription> {
        self.base().describe().await
    }
}

impl std::fmt::Debug for SchedulerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulerKind")
            .field("id", &self.id())
            .field("task_type", &self.task_type())
            .finish()
    }
}
