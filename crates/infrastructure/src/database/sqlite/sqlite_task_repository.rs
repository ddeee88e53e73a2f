use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    entities::{Task, TaskStatus},
    repositories::{StatusCounts, TaskQuery, TaskRepository, DEFAULT_PAGE_LIMIT},
};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    database::{
        filter_sql::{push_filters, TASK_COLUMNS},
        mapping::MappingHelpers,
    },
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    repo_context,
};

const SELECT_TASK: &str = "SELECT id, scheduler_id, organisation, task_type, hash, priority, status, data, deduplication_key, meta, pending, queued, dispatched, running, created_at, modified_at FROM tasks";

pub struct SqliteTaskRepository {
    pool: SqlitePool,
}

impl SqliteTaskRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_task(row: &SqliteRow) -> SchedulerResult<Task> {
        Ok(Task {
            id: MappingHelpers::get_uuid(row, "id")?,
            scheduler_id: row.try_get("scheduler_id")?,
            organisation: row.try_get("organisation")?,
            task_type: row.try_get("task_type")?,
            hash: row.try_get("hash")?,
            priority: row.try_get("priority")?,
            status: row.try_get("status")?,
            data: MappingHelpers::get_json(row, "data")?,
            deduplication_key: MappingHelpers::get_optional_uuid(row, "deduplication_key")?,
            meta: MappingHelpers::get_optional_json(row, "meta")?,
            pending: row.try_get("pending")?,
            queued: row.try_get("queued")?,
            dispatched: row.try_get("dispatched")?,
            running: row.try_get("running")?,
            created_at: MappingHelpers::get_timestamp(row, "created_at")?,
            modified_at: MappingHelpers::get_timestamp(row, "modified_at")?,
        })
    }

    /// 列表与计数共用的 WHERE 条件
    fn push_conditions(
        builder: &mut QueryBuilder<'_, Sqlite>,
        query: &TaskQuery,
    ) -> SchedulerResult<()> {
        builder.push(" WHERE 1 = 1");
        if let Some(scheduler_id) = &query.scheduler_id {
            builder.push(" AND scheduler_id = ").push_bind(scheduler_id.clone());
        }
        if let Some(task_type) = query.task_type {
            builder.push(" AND task_type = ").push_bind(task_type);
        }
        if let Some(status) = query.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(min) = &query.min_created_at {
            builder
                .push(" AND created_at >= ")
                .push_bind(MappingHelpers::format_timestamp(min));
        }
        if let Some(max) = &query.max_created_at {
            builder
                .push(" AND created_at <= ")
                .push_bind(MappingHelpers::format_timestamp(max));
        }
        if let Some(filters) = &query.filters {
            push_filters(builder, filters, TASK_COLUMNS)?;
        }
        Ok(())
    }

    fn empty_counts() -> StatusCounts {
        TaskStatus::ALL.into_iter().map(|status| (status, 0)).collect()
    }
}

#[async_trait]
impl TaskRepository for SqliteTaskRepository {
    #[instrument(skip(self, task), fields(task_id = %task.id, scheduler_id = %task.scheduler_id))]
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let context = repo_context!(RepositoryOperation::Create, "任务", id = task.id, scheduler = &task.scheduler_id);

        let data = MappingHelpers::to_json_text(&task.data)?;
        let meta = task.meta.as_ref().map(MappingHelpers::to_json_text).transpose()?;

        let row = sqlx::query(
            r#"
            INSERT INTO tasks (id, scheduler_id, organisation, task_type, hash, priority, status, data,
                               deduplication_key, meta, pending, queued, dispatched, running, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING id, scheduler_id, organisation, task_type, hash, priority, status, data, deduplication_key,
                      meta, pending, queued, dispatched, running, created_at, modified_at
            "#,
        )
        .bind(task.id.to_string())
        .bind(&task.scheduler_id)
        .bind(&task.organisation)
        .bind(task.task_type)
        .bind(&task.hash)
        .bind(task.priority)
        .bind(task.status)
        .bind(data)
        .bind(task.deduplication_key.map(|k| k.to_string()))
        .bind(meta)
        .bind(task.pending)
        .bind(task.queued)
        .bind(task.dispatched)
        .bind(task.running)
        .bind(MappingHelpers::format_timestamp(&task.created_at))
        .bind(MappingHelpers::format_timestamp(&task.modified_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let created = Self::row_to_task(&row)?;
        RepositoryErrorHelpers::log_operation_success(&context, Some(&format!("状态: {}", created.status)));
        Ok(created)
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, status = %task.status))]
    async fn update(&self, task: &Task) -> SchedulerResult<Task> {
        let context = repo_context!(RepositoryOperation::Update, "任务", id = task.id);

        let data = MappingHelpers::to_json_text(&task.data)?;
        let meta = task.meta.as_ref().map(MappingHelpers::to_json_text).transpose()?;

        let row = sqlx::query(
            r#"
            UPDATE tasks
            SET priority = ?, status = ?, data = ?, deduplication_key = ?, meta = ?,
                pending = ?, queued = ?, dispatched = ?, running = ?, modified_at = ?
            WHERE id = ?
            RETURNING id, scheduler_id, organisation, task_type, hash, priority, status, data, deduplication_key,
                      meta, pending, queued, dispatched, running, created_at, modified_at
            "#,
        )
        .bind(task.priority)
        .bind(task.status)
        .bind(data)
        .bind(task.deduplication_key.map(|k| k.to_string()))
        .bind(meta)
        .bind(task.pending)
        .bind(task.queued)
        .bind(task.dispatched)
        .bind(task.running)
        .bind(MappingHelpers::format_timestamp(&task.modified_at))
        .bind(task.id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        match row {
            Some(row) => {
                let updated = Self::row_to_task(&row)?;
                RepositoryErrorHelpers::log_operation_success(&context, Some(&format!("状态: {}", updated.status)));
                Ok(updated)
            }
            None => Err(RepositoryErrorHelpers::not_found(&context)),
        }
    }

    #[instrument(skip(self), fields(task_id = %id))]
    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Task>> {
        let context = repo_context!(RepositoryOperation::Read, "任务", id = id);

        let row = sqlx::query(&format!("{SELECT_TASK} WHERE id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        match row {
            Some(row) => Ok(Some(Self::row_to_task(&row)?)),
            None => {
                debug!("查询任务不存在: ID {}", id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, query))]
    async fn list(&self, query: &TaskQuery) -> SchedulerResult<(Vec<Task>, i64)> {
        let context = repo_context!(RepositoryOperation::Query, "任务");

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM tasks");
        Self::push_conditions(&mut count, query)?;
        let total: i64 = count
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            .try_get("total")?;

        let mut select = QueryBuilder::<Sqlite>::new(SELECT_TASK);
        Self::push_conditions(&mut select, query)?;
        select
            .push(" ORDER BY created_at DESC LIMIT ")
            .push_bind(query.limit.unwrap_or(DEFAULT_PAGE_LIMIT))
            .push(" OFFSET ")
            .push_bind(query.offset.max(0));

        let rows = select
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let tasks = rows
            .iter()
            .map(Self::row_to_task)
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!("检索任务: 返回 {} 条, 共 {} 条", tasks.len(), total);
        Ok((tasks, total))
    }

    #[instrument(skip(self))]
    async fn get_by_hash(&self, hash: &str, limit: i64) -> SchedulerResult<Vec<Task>> {
        let context = repo_context!(RepositoryOperation::Read, "任务", id = hash);

        let rows = sqlx::query(&format!(
            "{SELECT_TASK} WHERE hash = ? ORDER BY created_at DESC LIMIT ?"
        ))
        .bind(hash)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    async fn get_latest_by_hash(&self, hash: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.get_by_hash(hash, 1).await?.into_iter().next())
    }

    #[instrument(skip(self))]
    async fn cancel_queued(&self, scheduler_id: &str) -> SchedulerResult<u64> {
        let context = repo_context!(RepositoryOperation::Update, "任务", scheduler = scheduler_id);

        let result = sqlx::query(
            "UPDATE tasks SET status = ?, modified_at = ? WHERE scheduler_id = ? AND status = ?",
        )
        .bind(TaskStatus::Cancelled)
        .bind(MappingHelpers::format_timestamp(&Utc::now()))
        .bind(scheduler_id)
        .bind(TaskStatus::Queued)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        debug!("调度器 {} 取消了 {} 个排队任务", scheduler_id, result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn status_counts(&self, scheduler_id: Option<&str>) -> SchedulerResult<StatusCounts> {
        let context = repo_context!(RepositoryOperation::Query, "任务统计");

        let mut builder =
            QueryBuilder::<Sqlite>::new("SELECT status, COUNT(*) AS count FROM tasks WHERE 1 = 1");
        if let Some(scheduler_id) = scheduler_id {
            builder.push(" AND scheduler_id = ").push_bind(scheduler_id.to_string());
        }
        builder.push(" GROUP BY status");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let mut counts = Self::empty_counts();
        for row in rows {
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            counts.insert(status, count);
        }
        Ok(counts)
    }

    async fn status_counts_per_hour(
        &self,
        scheduler_id: Option<&str>,
        hours: i64,
    ) -> SchedulerResult<BTreeMap<String, StatusCounts>> {
        let context = repo_context!(RepositoryOperation::Query, "任务统计");
        let since = Utc::now() - Duration::hours(hours.max(1));

        // 时间戳文本的前 13 个字符即 `YYYY-MM-DDTHH`
        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT substr(modified_at, 1, 13) || ':00' AS hour, status, COUNT(*) AS count FROM tasks WHERE modified_at >= ",
        );
        builder.push_bind(MappingHelpers::format_timestamp(&since));
        if let Some(scheduler_id) = scheduler_id {
            builder.push(" AND scheduler_id = ").push_bind(scheduler_id.to_string());
        }
        builder.push(" GROUP BY hour, status");

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let mut per_hour: BTreeMap<String, StatusCounts> = BTreeMap::new();
        for row in rows {
            let hour: String = row.try_get("hour")?;
            let status: TaskStatus = row.try_get("status")?;
            let count: i64 = row.try_get("count")?;
            per_hour
                .entry(hour)
                .or_insert_with(Self::empty_counts)
                .insert(status, count);
        }
        Ok(per_hour)
    }
}
