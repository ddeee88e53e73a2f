//! 仓储操作的错误上下文
//!
//! 数据库错误在这里统一记录日志并归类：唯一约束冲突转为 `NotAllowed`，
//! 其余保持为存储错误。

use std::fmt;

use scheduler_core::SchedulerError;
use sqlx::Error as SqlxError;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
    Upsert,
    Pop,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "检索"),
            RepositoryOperation::Upsert => write!(f, "写入"),
            RepositoryOperation::Pop => write!(f, "出队"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: RepositoryOperation,
    pub entity: &'static str,
    pub id: Option<String>,
    pub scheduler_id: Option<String>,
}

impl OperationContext {
    pub fn new(operation: RepositoryOperation, entity: &'static str) -> Self {
        Self {
            operation,
            entity,
            id: None,
            scheduler_id: None,
        }
    }

    pub fn with_id(mut self, id: impl ToString) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_scheduler(mut self, scheduler_id: &str) -> Self {
        self.scheduler_id = Some(scheduler_id.to_string());
        self
    }

    pub fn entity_description(&self) -> String {
        match (&self.id, &self.scheduler_id) {
            (Some(id), Some(scheduler)) => format!("{} {} (调度器: {})", self.entity, id, scheduler),
            (Some(id), None) => format!("{} {}", self.entity, id),
            (None, Some(scheduler)) => format!("{} (调度器: {})", self.entity, scheduler),
            (None, None) => self.entity.to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    pub fn database_error(context: &OperationContext, error: SqlxError) -> SchedulerError {
        let description = context.entity_description();

        if let SqlxError::Database(db_error) = &error {
            if db_error.is_unique_violation() {
                let msg = format!("{}{}时发生唯一约束冲突: 记录已存在", context.operation, description);
                debug!(error = %error, "{}", msg);
                return SchedulerError::NotAllowed(msg);
            }
        }

        error!(
            error = %error,
            operation = %context.operation,
            "{}{}时发生数据库错误",
            context.operation,
            description
        );
        SchedulerError::Database(error)
    }

    pub fn not_found(context: &OperationContext) -> SchedulerError {
        SchedulerError::not_found(
            context.entity,
            context.id.clone().unwrap_or_default(),
        )
    }

    pub fn log_operation_success(context: &OperationContext, additional_info: Option<&str>) {
        let base_msg = format!("{}{}成功", context.operation, context.entity_description());
        match additional_info {
            Some(info) => debug!("{}: {}", base_msg, info),
            None => debug!("{}", base_msg),
        }
    }
}

#[macro_export]
macro_rules! repo_context {
    ($operation:expr, $entity:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity)
    };
    ($operation:expr, $entity:expr, id = $id:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity).with_id($id)
    };
    ($operation:expr, $entity:expr, scheduler = $scheduler:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity).with_scheduler($scheduler)
    };
    ($operation:expr, $entity:expr, id = $id:expr, scheduler = $scheduler:expr) => {
        $crate::error_handling::OperationContext::new($operation, $entity)
            .with_id($id)
            .with_scheduler($scheduler)
    };
}
