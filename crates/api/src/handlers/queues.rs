use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use scheduler_core::SchedulerError;
use scheduler_domain::{FilterRequest, PrioritizedItem};
use uuid::Uuid;

use crate::{
    error::{ApiError, ApiResult},
    response::{created, success},
    routes::AppState,
};

#[derive(Debug, Deserialize)]
pub struct PopParams {
    pub limit: Option<i64>,
}

/// 推入请求；`hash` 若提供必须与负载计算结果一致
#[derive(Debug, Deserialize)]
pub struct PushRequest {
    pub priority: Option<i64>,
    pub data: serde_json::Value,
    pub hash: Option<String>,
}

pub async fn list_queues(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut queues = Vec::new();
    for scheduler in state.registry.list().await {
        queues.push(scheduler.base().queue().describe().await?);
    }
    Ok(success(queues))
}

pub async fn get_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let scheduler = state.registry.get_or_not_found(&id).await?;
    Ok(success(scheduler.base().queue().describe().await?))
}

/// 取出最多 `limit` 个任务，队列为空时返回空列表
pub async fn pop_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<PopParams>,
    body: Option<Json<FilterRequest>>,
) -> ApiResult<impl IntoResponse> {
    let limit = params.limit.unwrap_or(1);
    if limit < 1 {
        return Err(ApiError::BadRequest(format!("limit 必须大于 0: {limit}")));
    }

    let scheduler = state.registry.get_or_not_found(&id).await?;
    let filters = body.map(|Json(filters)| filters).filter(|f| !f.is_empty());

    let tasks = match scheduler.pop_item_from_queue(filters.as_ref(), limit).await {
        Ok(tasks) => tasks,
        Err(SchedulerError::QueueEmpty { .. }) => Vec::new(),
        Err(e) => return Err(e.into()),
    };
    Ok(success(tasks))
}

pub async fn push_queue(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PushRequest>,
) -> ApiResult<impl IntoResponse> {
    let scheduler = state.registry.get_or_not_found(&id).await?;

    let mut item = PrioritizedItem::new(scheduler.id(), 0, request.data);
    item.priority = request.priority;
    item.id = item.payload_id().unwrap_or_else(Uuid::new_v4);

    let computed = scheduler.base().queue().create_hash(&item)?;
    if let Some(hash) = request.hash.filter(|h| h != &computed) {
        return Err(ApiError::BadRequest(format!(
            "哈希 {hash} 与负载不一致，应为 {computed}"
        )));
    }

    let task = scheduler.push_item_to_queue(item).await?;
    Ok(created(task))
}
