use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use scheduler_dispatcher::SchedulerRegistry;
use scheduler_domain::{ScheduleRepository, TaskRepository};
use scheduler_infrastructure::{DatabaseManager, EventBus, MetricsCollector};

use crate::handlers::{
    events::{publish_artifact, publish_scan_level},
    health::health_check,
    metrics::metrics,
    queues::{get_queue, list_queues, pop_queue, push_queue},
    schedulers::{get_scheduler, list_schedulers, patch_scheduler},
    schedules::{
        create_schedule, delete_schedule, get_schedule, list_schedules, patch_schedule,
        search_schedules,
    },
    tasks::{get_task, list_tasks, patch_task, search_tasks, task_stats, task_stats_hourly},
};

/// API应用状态
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SchedulerRegistry>,
    pub task_repo: Arc<dyn TaskRepository>,
    pub schedule_repo: Arc<dyn ScheduleRepository>,
    pub events: Arc<EventBus>,
    pub metrics: MetricsCollector,
    /// 健康检查使用；测试中可为空
    pub database: Option<DatabaseManager>,
    pub default_schedule_interval: chrono::Duration,
}

/// 创建API路由
pub fn create_routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        // 调度器
        .route("/schedulers", get(list_schedulers))
        .route("/schedulers/{id}", get(get_scheduler).patch(patch_scheduler))
        // 队列
        .route("/queues", get(list_queues))
        .route("/queues/{id}", get(get_queue))
        .route("/queues/{id}/pop", post(pop_queue))
        .route("/queues/{id}/push", post(push_queue))
        // 任务
        .route("/tasks", get(list_tasks))
        .route("/tasks/search", post(search_tasks))
        .route("/tasks/stats", get(task_stats))
        .route("/tasks/stats/hourly", get(task_stats_hourly))
        .route("/tasks/{id}", get(get_task).patch(patch_task))
        // 调度记录
        .route("/schedules", get(list_schedules).post(create_schedule))
        .route("/schedules/search", post(search_schedules))
        .route(
            "/schedules/{id}",
            get(get_schedule)
                .patch(patch_schedule)
                .delete(delete_schedule),
        )
        // 事件入口
        .route("/events/scan-levels", post(publish_scan_level))
        .route("/events/artifacts", post(publish_artifact))
        .with_state(state)
}
