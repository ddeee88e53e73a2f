//! 事件入口
//!
//! 外部消息适配器通过这些接口把事件投递到进程内的事件总线。

use axum::{extract::State, response::IntoResponse, Json};
use scheduler_core::SchedulerError;
use scheduler_domain::{DomainEvent, RawArtifactReceived, ScanLevelMutation};
use scheduler_infrastructure::SchedulerEvent;

use crate::{error::ApiResult, response::accepted, routes::AppState};

async fn publish(state: &AppState, event: SchedulerEvent) -> ApiResult<()> {
    let organisation = event.organisation().to_string();
    if state
        .registry
        .list_by_organisation(&organisation)
        .await
        .is_empty()
    {
        return Err(SchedulerError::not_found("租户", organisation).into());
    }
    state.events.publish(event).await?;
    Ok(())
}

pub async fn publish_scan_level(
    State(state): State<AppState>,
    Json(mutation): Json<ScanLevelMutation>,
) -> ApiResult<impl IntoResponse> {
    publish(&state, SchedulerEvent::ScanLevel(mutation)).await?;
    Ok(accepted("扫描等级事件已接收"))
}

pub async fn publish_artifact(
    State(state): State<AppState>,
    Json(received): Json<RawArtifactReceived>,
) -> ApiResult<impl IntoResponse> {
    publish(&state, SchedulerEvent::RawArtifact(received)).await?;
    Ok(accepted("原始数据事件已接收"))
}
