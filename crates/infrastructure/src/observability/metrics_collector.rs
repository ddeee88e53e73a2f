//! 调度器指标
//!
//! 通过 `metrics` 门面记录，Prometheus 导出器负责渲染文本格式。

use metrics::{counter, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{StatusCounts, TaskStatus};
use tracing::info;

#[derive(Clone)]
pub struct MetricsCollector {
    handle: Option<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsCollector")
            .field("enabled", &self.handle.is_some())
            .finish()
    }
}

impl MetricsCollector {
    /// 安装全局 Prometheus recorder，进程内只能调用一次
    pub fn install() -> SchedulerResult<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| SchedulerError::Internal(format!("安装Prometheus导出器失败: {e}")))?;
        info!("Prometheus指标导出器已安装");
        Ok(Self {
            handle: Some(handle),
        })
    }

    pub fn from_handle(handle: PrometheusHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    /// 不导出指标；记录调用仍然安全
    pub fn disabled() -> Self {
        Self { handle: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.handle.is_some()
    }

    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(|h| h.render())
    }

    pub fn record_queue_size(&self, scheduler_id: &str, size: i64) {
        gauge!("scheduler_queue_size", "scheduler_id" => scheduler_id.to_string()).set(size as f64);
    }

    pub fn record_task_counts(&self, scheduler_id: &str, counts: &StatusCounts) {
        for status in TaskStatus::ALL.iter() {
            let count = counts.get(status).copied().unwrap_or(0);
            gauge!(
                "scheduler_tasks",
                "scheduler_id" => scheduler_id.to_string(),
                "status" => status.as_str()
            )
            .set(count as f64);
        }
    }

    pub fn record_push(&self, scheduler_id: &str) {
        counter!("scheduler_pushed_total", "scheduler_id" => scheduler_id.to_string()).increment(1);
    }

    pub fn record_pop(&self, scheduler_id: &str, count: usize) {
        counter!("scheduler_popped_total", "scheduler_id" => scheduler_id.to_string())
            .increment(count as u64);
    }

    pub fn record_rejection(&self, scheduler_id: &str, reason: &'static str) {
        counter!(
            "scheduler_push_rejected_total",
            "scheduler_id" => scheduler_id.to_string(),
            "reason" => reason
        )
        .increment(1);
    }
}
