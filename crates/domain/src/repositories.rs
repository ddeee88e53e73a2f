//! 领域仓储抽象
//!
//! 调度器与 API 只通过这些接口访问共享状态，不依赖进程内的共享结构

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;
use uuid::Uuid;

use crate::entities::{PrioritizedItem, Schedule, Task, TaskStatus, TaskType};
use crate::filters::FilterRequest;

pub const DEFAULT_PAGE_LIMIT: i64 = 100;

/// 任务列表查询条件
#[derive(Debug, Clone, Default)]
pub struct TaskQuery {
    pub scheduler_id: Option<String>,
    pub task_type: Option<TaskType>,
    pub status: Option<TaskStatus>,
    pub min_created_at: Option<DateTime<Utc>>,
    pub max_created_at: Option<DateTime<Utc>>,
    pub filters: Option<FilterRequest>,
    pub offset: i64,
    pub limit: Option<i64>,
}

/// 调度记录查询条件
#[derive(Debug, Clone, Default)]
pub struct ScheduleQuery {
    pub scheduler_id: Option<String>,
    pub hash: Option<String>,
    pub enabled: Option<bool>,
    pub min_deadline_at: Option<DateTime<Utc>>,
    pub max_deadline_at: Option<DateTime<Utc>>,
    pub filters: Option<FilterRequest>,
    pub offset: i64,
    pub limit: Option<i64>,
}

pub type StatusCounts = HashMap<TaskStatus, i64>;

/// 任务仓储抽象
#[async_trait]
pub trait TaskRepository: Send + Sync {
    async fn create(&self, task: &Task) -> SchedulerResult<Task>;
    async fn update(&self, task: &Task) -> SchedulerResult<Task>;
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>>;
    /// 按 created_at 倒序分页，返回 (结果, 总数)
    async fn list(&self, query: &TaskQuery) -> SchedulerResult<(Vec<Task>, i64)>;
    /// 同一哈希的历史任务，最新在前
    async fn get_by_hash(&self, hash: &str, limit: i64) -> SchedulerResult<Vec<Task>>;
    async fn get_latest_by_hash(&self, hash: &str) -> SchedulerResult<Option<Task>>;
    /// 将调度器下所有 QUEUED 任务置为 CANCELLED，返回受影响行数
    async fn cancel_queued(&self, scheduler_id: &str) -> SchedulerResult<u64>;
    async fn status_counts(&self, scheduler_id: Option<&str>) -> SchedulerResult<StatusCounts>;
    /// 最近若干小时内按小时聚合的状态计数，键为 `YYYY-MM-DDTHH:00`
    async fn status_counts_per_hour(
        &self,
        scheduler_id: Option<&str>,
        hours: i64,
    ) -> SchedulerResult<BTreeMap<String, StatusCounts>>;
}

/// 调度记录仓储抽象
#[async_trait]
pub trait ScheduleRepository: Send + Sync {
    async fn create(&self, schedule: &Schedule) -> SchedulerResult<Schedule>;
    async fn update(&self, schedule: &Schedule) -> SchedulerResult<Schedule>;
    async fn delete(&self, id: Uuid) -> SchedulerResult<()>;
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Schedule>>;
    async fn get_by_hash(&self, hash: &str) -> SchedulerResult<Option<Schedule>>;
    async fn list(&self, query: &ScheduleQuery) -> SchedulerResult<(Vec<Schedule>, i64)>;
    /// 已启用且截止时间早于 `now` 的调度记录
    async fn get_expired(
        &self,
        scheduler_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Schedule>>;
    /// 以哈希为键插入或更新，并重新启用
    async fn upsert_by_hash(&self, schedule: &Schedule) -> SchedulerResult<Schedule>;
}

/// 优先级队列的持久化
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// 以 (scheduler_id, hash) 为键对 QUEUED 条目插入或更新，单条语句完成
    async fn upsert(&self, item: &PrioritizedItem) -> SchedulerResult<PrioritizedItem>;
    /// 原子地选出最优先的条目并置为 DISPATCHED
    async fn pop(
        &self,
        scheduler_id: &str,
        filters: Option<&FilterRequest>,
        limit: i64,
    ) -> SchedulerResult<Vec<PrioritizedItem>>;
    async fn peek(&self, scheduler_id: &str, index: i64)
        -> SchedulerResult<Option<PrioritizedItem>>;
    async fn get_queued_by_hash(
        &self,
        scheduler_id: &str,
        hash: &str,
    ) -> SchedulerResult<Option<PrioritizedItem>>;
    async fn list_queued(&self, scheduler_id: &str) -> SchedulerResult<Vec<PrioritizedItem>>;
    async fn remove(&self, scheduler_id: &str, id: Uuid) -> SchedulerResult<()>;
    /// 删除所有 QUEUED 条目，返回删除数量
    async fn clear(&self, scheduler_id: &str) -> SchedulerResult<u64>;
    async fn qsize(&self, scheduler_id: &str) -> SchedulerResult<i64>;
}
