use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use scheduler_core::SchedulerError;
use serde_json::json;

/// 队列已满时建议客户端等待的秒数
pub const RETRY_AFTER_SECONDS: u64 = 60;

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("调度器错误: {0}")]
    Scheduler(#[from] SchedulerError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("请求参数错误: {0}")]
    BadRequest(String),

    #[error("内部服务器错误: {0}")]
    Internal(String),
}

impl ApiError {
    fn parts(&self) -> (StatusCode, String, &'static str, Vec<String>) {
        match self {
            ApiError::Scheduler(SchedulerError::QueueFull { queue_id }) => (
                StatusCode::TOO_MANY_REQUESTS,
                format!("队列 {} 已满", queue_id),
                "QUEUE_FULL",
                vec![format!("请在 {} 秒后重试", RETRY_AFTER_SECONDS)],
            ),
            ApiError::Scheduler(SchedulerError::QueueEmpty { queue_id }) => (
                StatusCode::NOT_FOUND,
                format!("队列 {} 为空", queue_id),
                "QUEUE_EMPTY",
                vec![],
            ),
            ApiError::Scheduler(SchedulerError::NotAllowed(msg)) => (
                StatusCode::CONFLICT,
                format!("操作不允许: {}", msg),
                "NOT_ALLOWED",
                vec!["请刷新资源状态后重试".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::ItemNotFound { entity, id }) => (
                StatusCode::NOT_FOUND,
                format!("{} {} 不存在", entity, id),
                "NOT_FOUND",
                vec!["请检查ID是否正确".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::InvalidItem(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("队列项无效: {}", msg),
                "INVALID_ITEM",
                vec!["请检查负载是否符合调度器的任务类型".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::Storage(msg)) => (
                StatusCode::BAD_REQUEST,
                format!("查询条件无效: {}", msg),
                "INVALID_FILTER",
                vec!["请检查过滤字段与操作符".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::InvalidCron { expr, message }) => (
                StatusCode::BAD_REQUEST,
                format!("Cron表达式 '{}' 无效: {}", expr, message),
                "INVALID_CRON_EXPRESSION",
                vec!["示例: '0 */5 * * * *' (每5分钟执行一次)".to_string()],
            ),
            ApiError::Scheduler(SchedulerError::Serialization(msg)) => (
                StatusCode::BAD_REQUEST,
                msg.clone(),
                "BAD_REQUEST",
                vec![],
            ),
            ApiError::Scheduler(SchedulerError::ExternalService { service, message }) => (
                StatusCode::BAD_GATEWAY,
                format!("外部服务 {} 出错: {}", service, message),
                "EXTERNAL_SERVICE_ERROR",
                vec!["请稍后重试".to_string()],
            ),
            ApiError::Serialization(err) => (
                StatusCode::BAD_REQUEST,
                "请求数据格式错误".to_string(),
                "SERIALIZATION_ERROR",
                vec![format!("详细错误: {}", err)],
            ),
            ApiError::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                format!("请求参数错误: {}", msg),
                "BAD_REQUEST",
                vec!["请检查请求格式和参数".to_string()],
            ),
            ApiError::Scheduler(_) | ApiError::Internal(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "系统内部错误".to_string(),
                "INTERNAL_ERROR",
                vec![
                    "系统遇到内部错误，请稍后重试".to_string(),
                    "查看 GET /health 检查系统状态".to_string(),
                ],
            ),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message, error_type, suggestions) = self.parts();
        if status.is_server_error() {
            tracing::error!("请求处理失败: {}", self);
        }

        let body = Json(json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": status.as_u16(),
                "suggestions": suggestions,
                "timestamp": chrono::Utc::now().to_rfc3339(),
            }
        }));

        let mut response = (status, body).into_response();
        if status == StatusCode::TOO_MANY_REQUESTS {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECONDS));
        }
        response
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_full_maps_to_429_with_retry_after() {
        let error = ApiError::Scheduler(SchedulerError::QueueFull {
            queue_id: "scan-org1".to_string(),
        });
        let response = error.into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[header::RETRY_AFTER], "60");
    }

    #[test]
    fn test_scheduler_error_status_mapping() {
        let cases = vec![
            (SchedulerError::NotAllowed("x".into()), StatusCode::CONFLICT),
            (SchedulerError::not_found("任务", 1), StatusCode::NOT_FOUND),
            (SchedulerError::InvalidItem("x".into()), StatusCode::BAD_REQUEST),
            (SchedulerError::Storage("bad column".into()), StatusCode::BAD_REQUEST),
            (SchedulerError::Internal("boom".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];

        for (error, expected) in cases {
            let response = ApiError::from(error).into_response();
            assert_eq!(response.status(), expected);
        }
    }

    #[test]
    fn test_bad_request_display() {
        let error = ApiError::BadRequest("请求体为空".to_string());
        assert_eq!(error.to_string(), "请求参数错误: 请求体为空");
        assert_eq!(error.into_response().status(), StatusCode::BAD_REQUEST);
    }
}
