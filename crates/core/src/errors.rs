use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("队列已满: {queue_id}")]
    QueueFull { queue_id: String },

    #[error("队列为空: {queue_id}")]
    QueueEmpty { queue_id: String },

    #[error("无效的队列项: {0}")]
    InvalidItem(String),

    #[error("操作不被允许: {0}")]
    NotAllowed(String),

    #[error("{entity}未找到: {id}")]
    ItemNotFound { entity: String, id: String },

    #[error("外部服务错误: {service} - {message}")]
    ExternalService { service: String, message: String },

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCron { expr: String, message: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    pub fn not_found(entity: impl Into<String>, id: impl ToString) -> Self {
        Self::ItemNotFound {
            entity: entity.into(),
            id: id.to_string(),
        }
    }

    pub fn external(service: impl Into<String>, message: impl ToString) -> Self {
        Self::ExternalService {
            service: service.into(),
            message: message.to_string(),
        }
    }

    /// 持久化层失败（含非法过滤表达式）
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage(_) | Self::Database(_))
    }

    /// 入队时的预期拒绝：只需 debug 记录，不向上抛出
    pub fn is_push_rejection(&self) -> bool {
        matches!(
            self,
            Self::QueueFull { .. } | Self::NotAllowed(_) | Self::InvalidItem(_)
        )
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
