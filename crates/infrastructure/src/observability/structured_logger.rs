//! 结构化日志工具
//!
//! 每个辅助函数输出固定的 `event` 字段，便于日志平台按事件检索。

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_task_pushed(scheduler_id: &str, task_id: Uuid, hash: &str, priority: i64) {
        debug!(
            event = "task_pushed",
            scheduler.id = scheduler_id,
            task.id = %task_id,
            task.hash = hash,
            task.priority = priority,
            "任务已入队"
        );
    }

    pub fn log_task_popped(scheduler_id: &str, task_ids: &[Uuid]) {
        info!(
            event = "task_popped",
            scheduler.id = scheduler_id,
            task.count = task_ids.len(),
            task.ids = ?task_ids,
            "任务已出队并标记为已分发"
        );
    }

    /// 候选任务未入队；预期内的跳过只记录 debug
    pub fn log_task_skipped(scheduler_id: &str, hash: &str, reason: &str) {
        debug!(
            event = "task_skipped",
            scheduler.id = scheduler_id,
            task.hash = hash,
            skip.reason = reason,
            "跳过候选任务"
        );
    }

    pub fn log_schedule_disabled(scheduler_id: &str, schedule_id: Uuid, reason: &str) {
        info!(
            event = "schedule_disabled",
            scheduler.id = scheduler_id,
            schedule.id = %schedule_id,
            schedule.reason = reason,
            "调度记录已停用"
        );
    }

    pub fn log_stale_task_failed(
        scheduler_id: &str,
        task_id: Uuid,
        hash: &str,
        last_modified: DateTime<Utc>,
    ) {
        warn!(
            event = "stale_task_failed",
            scheduler.id = scheduler_id,
            task.id = %task_id,
            task.hash = hash,
            task.modified_at = %last_modified,
            "任务分发后长时间无进展，已标记为失败"
        );
    }

    pub fn log_scheduler_enabled(scheduler_id: &str, loops: usize) {
        info!(
            event = "scheduler_enabled",
            scheduler.id = scheduler_id,
            scheduler.loops = loops,
            "调度器已启用"
        );
    }

    pub fn log_scheduler_disabled(scheduler_id: &str, removed_items: u64, cancelled_tasks: u64) {
        info!(
            event = "scheduler_disabled",
            scheduler.id = scheduler_id,
            queue.removed = removed_items,
            task.cancelled = cancelled_tasks,
            "调度器已停用"
        );
    }
}
