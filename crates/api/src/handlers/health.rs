use axum::{extract::State, http::StatusCode, Json};
use serde_json::{json, Value};

use crate::routes::AppState;

/// 健康检查：数据库可用时返回 200，否则 503
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<Value>) {
    let database = match &state.database {
        Some(db) => match db.health_check().await {
            Ok(()) => "ok".to_string(),
            Err(e) => {
                tracing::warn!("数据库健康检查失败: {}", e);
                format!("error: {e}")
            }
        },
        None => "not_configured".to_string(),
    };
    let healthy = !database.starts_with("error");

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "status": if healthy { "ok" } else { "degraded" },
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "service": "scan-scheduler",
            "version": env!("CARGO_PKG_VERSION"),
            "database": database,
            "schedulers": state.registry.len().await,
        })),
    )
}
