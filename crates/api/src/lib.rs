//! # Scheduler API
//!
//! 扫描调度核心的 REST API，供 worker 与运维人员使用。
//!
//! ## API 端点
//!
//! ### 调度器与队列
//! - `GET /schedulers`、`GET /schedulers/{id}`、`PATCH /schedulers/{id}`（启用/停用）
//! - `GET /queues`、`GET /queues/{id}`
//! - `POST /queues/{id}/pop?limit=N` - 取出任务，可附带过滤表达式
//! - `POST /queues/{id}/push` - 推入任务
//!
//! ### 任务
//! - `GET /tasks`、`POST /tasks/search`
//! - `GET /tasks/stats`、`GET /tasks/stats/hourly`
//! - `GET /tasks/{id}`、`PATCH /tasks/{id}`（worker 回报状态）
//!
//! ### 调度记录
//! - `GET /schedules`、`POST /schedules`、`POST /schedules/search`
//! - `GET /schedules/{id}`、`PATCH /schedules/{id}`、`DELETE /schedules/{id}`
//!
//! ### 事件与监控
//! - `POST /events/scan-levels`、`POST /events/artifacts`
//! - `GET /health`、`GET /metrics`

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod response;
pub mod routes;

use axum::Router;
use tower::ServiceBuilder;

use middleware::{cors_layer, request_logging, trace_layer};
use routes::{create_routes, AppState};
use scheduler_core::ApiConfig;

pub use error::{ApiError, ApiResult};

/// 创建完整的API应用
pub fn create_app(state: AppState, api_config: &ApiConfig) -> Router {
    let router = create_routes(state).layer(
        ServiceBuilder::new()
            .layer(trace_layer())
            .layer(axum::middleware::from_fn(request_logging)),
    );

    if api_config.cors_enabled {
        router.layer(cors_layer(&api_config.cors_origins))
    } else {
        router
    }
}
