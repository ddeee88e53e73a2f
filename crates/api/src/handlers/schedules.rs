use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use scheduler_core::SchedulerError;
use scheduler_dispatcher::cron_utils::{calculate_deadline, CronScheduler};
use scheduler_domain::{FilterRequest, Schedule, ScheduleQuery, DEFAULT_PAGE_LIMIT};

use crate::{
    error::{ApiError, ApiResult},
    response::{created, no_content, success, PaginatedResponse},
    routes::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct ScheduleQueryParams {
    pub scheduler_id: Option<String>,
    pub hash: Option<String>,
    pub enabled: Option<bool>,
    pub min_deadline_at: Option<DateTime<Utc>>,
    pub max_deadline_at: Option<DateTime<Utc>>,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
}

impl ScheduleQueryParams {
    fn into_query(self, filters: Option<FilterRequest>) -> ScheduleQuery {
        ScheduleQuery {
            scheduler_id: self.scheduler_id,
            hash: self.hash,
            enabled: self.enabled,
            min_deadline_at: self.min_deadline_at,
            max_deadline_at: self.max_deadline_at,
            filters,
            offset: self.offset.unwrap_or(0).max(0),
            limit: self.limit,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduleRequest {
    pub scheduler_id: String,
    pub data: serde_json::Value,
    pub schedule: Option<String>,
    pub interval_seconds: Option<i64>,
    pub deadline_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PatchScheduleRequest {
    pub enabled: Option<bool>,
    pub data: Option<serde_json::Value>,
    pub schedule: Option<String>,
    pub interval_seconds: Option<i64>,
    pub deadline_at: Option<DateTime<Utc>>,
}

impl PatchScheduleRequest {
    fn is_empty(&self) -> bool {
        self.enabled.is_none()
            && self.data.is_none()
            && self.schedule.is_none()
            && self.interval_seconds.is_none()
            && self.deadline_at.is_none()
    }
}

fn validate_recurrence(schedule: Option<&str>, interval_seconds: Option<i64>) -> ApiResult<()> {
    if let Some(expr) = schedule.filter(|e| !e.trim().is_empty()) {
        CronScheduler::validate_cron_expression(expr)?;
    }
    if let Some(seconds) = interval_seconds.filter(|s| *s <= 0) {
        return Err(ApiError::BadRequest(format!("间隔必须大于 0: {seconds}")));
    }
    Ok(())
}

async fn paginate(state: &AppState, query: ScheduleQuery) -> ApiResult<impl IntoResponse> {
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_LIMIT);
    let offset = query.offset;
    let (schedules, total) = state.schedule_repo.list(&query).await?;
    Ok(success(PaginatedResponse::new(schedules, total, offset, limit)))
}

pub async fn list_schedules(
    State(state): State<AppState>,
    Query(params): Query<ScheduleQueryParams>,
) -> ApiResult<impl IntoResponse> {
    paginate(&state, params.into_query(None)).await
}

pub async fn search_schedules(
    State(state): State<AppState>,
    Query(params): Query<ScheduleQueryParams>,
    Json(filters): Json<FilterRequest>,
) -> ApiResult<impl IntoResponse> {
    let query = params.into_query(Some(filters).filter(|f| !f.is_empty()));
    paginate(&state, query).await
}

pub async fn get_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    let schedule = state
        .schedule_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| SchedulerError::not_found("调度记录", id))?;
    Ok(success(schedule))
}

/// 创建调度记录；负载按目标调度器的任务类型校验，哈希重复时拒绝
pub async fn create_schedule(
    State(state): State<AppState>,
    Json(request): Json<CreateScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    let scheduler = state.registry.get_or_not_found(&request.scheduler_id).await?;
    let hash = scheduler.task_type().validate_payload(&request.data)?;
    validate_recurrence(request.schedule.as_deref(), request.interval_seconds)?;

    if state.schedule_repo.get_by_hash(&hash).await?.is_some() {
        return Err(SchedulerError::NotAllowed(format!("哈希为 {hash} 的调度记录已存在")).into());
    }

    let deadline_at = match request.deadline_at {
        Some(deadline) => deadline,
        None => calculate_deadline(
            request.schedule.as_deref(),
            request.interval_seconds.map(Duration::seconds),
            state.default_schedule_interval,
            Utc::now(),
        )?,
    };

    let mut schedule = Schedule::new(scheduler.id(), scheduler.organisation(), hash, request.data);
    schedule.schedule = request.schedule;
    schedule.interval_seconds = request.interval_seconds;
    schedule.deadline_at = Some(deadline_at);

    let schedule = state.schedule_repo.create(&schedule).await?;
    info!("通过 API 创建调度记录 {} ({})", schedule.id, schedule.scheduler_id);
    Ok(created(schedule))
}

pub async fn patch_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<PatchScheduleRequest>,
) -> ApiResult<impl IntoResponse> {
    if request.is_empty() {
        return Err(ApiError::BadRequest("请求体为空".to_string()));
    }

    let mut schedule = state
        .schedule_repo
        .get_by_id(id)
        .await?
        .ok_or_else(|| SchedulerError::not_found("调度记录", id))?;

    validate_recurrence(request.schedule.as_deref(), request.interval_seconds)?;

    if let Some(data) = request.data {
        let scheduler = state.registry.get_or_not_found(&schedule.scheduler_id).await?;
        schedule.hash = scheduler.task_type().validate_payload(&data)?;
        schedule.data = data;
    }

    let recurrence_changed = request.schedule.is_some() || request.interval_seconds.is_some();
    if let Some(expr) = request.schedule {
        schedule.schedule = Some(expr).filter(|e| !e.trim().is_empty());
    }
    if let Some(seconds) = request.interval_seconds {
        schedule.interval_seconds = Some(seconds);
    }
    if let Some(enabled) = request.enabled {
        schedule.enabled = enabled;
    }

    if let Some(deadline) = request.deadline_at {
        schedule.deadline_at = Some(deadline);
    } else if recurrence_changed {
        schedule.deadline_at = Some(calculate_deadline(
            schedule.schedule.as_deref(),
            schedule.interval_seconds.map(Duration::seconds),
            state.default_schedule_interval,
            Utc::now(),
        )?);
    }

    schedule.modified_at = Utc::now();
    let schedule = state.schedule_repo.update(&schedule).await?;
    Ok(success(schedule))
}

pub async fn delete_schedule(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<impl IntoResponse> {
    if state.schedule_repo.get_by_id(id).await?.is_none() {
        return Err(SchedulerError::not_found("调度记录", id).into());
    }
    state.schedule_repo.delete(id).await?;
    info!("调度记录 {} 已删除", id);
    Ok(no_content())
}
