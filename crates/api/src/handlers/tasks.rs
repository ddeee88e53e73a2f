use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::{debug, info};
use uuid::Uuid;

use scheduler_core::SchedulerError;
use scheduler_domain::{FilterRequest, TaskQuery, TaskStatus, DEFAULT_PAGE_LIMIT};

use super::parse_optional;
use crate::{
    error::{ApiError, ApiResult},
    response::{success, PaginatedResponse},
    routes::AppState,
};

/// 按小时统计时回看的小时数
const STATS_WINDOW_HOURS: i64 = 24;

/// 任务查询参数
#[derive(Debug, Default, Deserialize)]
pub struct TaskQueryParams {
    pub scheduler_id: Option<String>,
    pub task_type: Option<String>,
    pub status: Option<String>,
    pub min_created_at: Option<DateTime<Utc>>,
    pub max_created_at: Option<DateTime<Utc>>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl TaskQueryParams {
    fn into_query(self, filters: Option<FilterRequest>) -> ApiResult<TaskQuery> {
        Ok(TaskQuery {
            task_type: parse_optional(self.task_type.as_deref())?,
            status: parse_optional(self.status.as_deref())?,
            scheduler_id: self.scheduler_id,
            min_created_at: self.min_created_at,
            max_created_at: self.max_created_at,
            filters,
            offset: self.offset.unwrap_or(0).max(0),
            limit: self.limit,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct StatsParams {
    pub scheduler_id: Option<String>,
}

/// 任务状态回报
#[derive(Debug, Default, Deserialize)]
pub struct PatchTaskRequest {
    pub status: Option<TaskStatus>,
}

async fn paginate(state: &AppState, query: TaskQuery) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset;
    let (tasks, total) = state.task_repo.list(&query).await?;
    Ok(success(PaginatedResponse::new(tasks, total, offset, limit)))
}

pub async fn list_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
) -> ApiResult<impl IntoResponse> {
    let query = params.into_query(None)?;
    paginate(&state, query).await
}

/// 带过滤表达式的任务查询
pub async fn search_tasks(
    State(state): State<AppState>,
    Query(params): Query<TaskQueryParams>,
    Json(filters): Json<FilterRequest>,
) -> ApiResult<impl IntoResponse> {
    let query = params.into_query(Some(filters).filter(|f| !f.is_empty()))?;
    paginate(&state, query).await
}

pub async fn task_stats(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<impl IntoResponse> {
    let counts = state
        .task_repo
        .status_counts(params.scheduler_id.as_deref())
        .await?;
    Ok(success(counts))
}

pub async fn task_stats_hourly(
    State(state): State<AppState>,
    Query(params): Query<StatsParams>,
) -> ApiResult<impl IntoResponse> {
    let counts = state
        .task_repo
        .status_counts_per_hour(params.scheduler_id.as_deref(), STATS_WINDOW_HOURS)
        .await?;
    Ok(success(counts))
}

pub async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let task = state
        .task_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| SchedulerError::not_found("任务", id))?;
    Ok(success(task))
}

/// worker 通过修改状态回报执行结果
pub async fn patch_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PatchTaskRequest>,
) -> ApiResult<impl IntoResponse> {
    let status = request
        .status
        .ok_or_else(|| ApiError::BadRequest("请求体为空".to_string()))?;

    let mut task = state
        .task_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| SchedulerError::not_found("任务", id))?;

    if task.status == status {
        debug!("任务 {} 状态未变化: {}", id, status);
        return Ok(success(task));
    }
    if !task.status.can_transition_to(status) {
        return Err(SchedulerError::NotAllowed(format!(
            "任务 {} 不能从 {} 变为 {}",
            id, task.status, status
        ))
        .into());
    }

    // 取消排队中的任务时同时移出队列
    if task.status == TaskStatus::Queued {
        if let Some(scheduler) = state.registry.get(&task.scheduler_id).await {
            match scheduler.base().queue().remove(task.id).await {
                Ok(()) | Err(SchedulerError::ItemNotFound { .. }) => {}
                Err(e) => return Err(e.into()),
            }
        }
    }

    let from = task.status;
    task.update_status(status);
    let task = state.task_repo.update(&task).await?;
    info!("任务 {} 状态更新: {} -> {}", id, from, status);

    Ok(success(task))
}
