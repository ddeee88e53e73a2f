use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use tracing::info;

use crate::{
    error::{ApiError, ApiResult},
    response::success,
    routes::AppState,
};

#[derive(Debug, Default, Deserialize)]
pub struct PatchSchedulerRequest {
    pub enabled: Option<bool>,
}

pub async fn list_schedulers(State(state): State<AppState>) -> ApiResult<impl IntoResponse> {
    let mut descriptions = Vec::new();
    for scheduler in state.registry.list().await {
        descriptions.push(scheduler.describe().await?);
    }
    Ok(success(descriptions))
}

pub async fn get_scheduler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let scheduler = state.registry.get_or_not_found(&id).await?;
    Ok(success(scheduler.describe().await?))
}

/// 启用或停用调度器
pub async fn patch_scheduler(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<PatchSchedulerRequest>,
) -> ApiResult<impl IntoResponse> {
    let enabled = request
        .enabled
        .ok_or_else(|| ApiError::BadRequest("请求体为空".to_string()))?;
    let scheduler = state.registry.get_or_not_found(&id).await?;

    if enabled != scheduler.is_enabled() {
        if enabled {
            scheduler.enable().await;
        } else {
            scheduler.disable().await?;
        }
        info!("调度器 {} 已通过 API {}", id, if enabled { "启用" } else { "停用" });
    }

    Ok(success(scheduler.describe().await?))
}
