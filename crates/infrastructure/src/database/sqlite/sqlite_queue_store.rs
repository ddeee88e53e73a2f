use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{
    entities::{PrioritizedItem, TaskStatus},
    filters::FilterRequest,
    repositories::QueueStore,
};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    database::{
        filter_sql::{push_filters, QUEUE_COLUMNS},
        mapping::MappingHelpers,
    },
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    repo_context,
};

const ITEM_FIELDS: &str =
    "seq, id, scheduler_id, hash, priority, data, status, created_at, modified_at";
const QUEUE_ORDER: &str = "ORDER BY priority ASC, created_at ASC, seq ASC";

/// 队列条目的持久化
///
/// 同一调度器内 QUEUED 状态的 (scheduler_id, hash) 由部分唯一索引约束，
/// 写入与出队都是单条语句，多个进程共享同一数据库时同样保持原子性。
pub struct SqliteQueueStore {
    pool: SqlitePool,
}

impl SqliteQueueStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_item(row: &SqliteRow) -> SchedulerResult<(i64, PrioritizedItem)> {
        let item = PrioritizedItem {
            id: MappingHelpers::get_uuid(row, "id")?,
            scheduler_id: row.try_get("scheduler_id")?,
            hash: Some(row.try_get("hash")?),
            priority: Some(row.try_get("priority")?),
            data: MappingHelpers::get_json(row, "data")?,
            status: row.try_get("status")?,
            created_at: MappingHelpers::get_timestamp(row, "created_at")?,
            modified_at: MappingHelpers::get_timestamp(row, "modified_at")?,
        };
        Ok((row.try_get("seq")?, item))
    }

    async fn fetch_queued(
        &self,
        scheduler_id: &str,
        clause: &str,
        bind: Option<String>,
    ) -> SchedulerResult<Vec<PrioritizedItem>> {
        let context = repo_context!(RepositoryOperation::Read, "队列项", scheduler = scheduler_id);

        let sql = format!(
            "SELECT {ITEM_FIELDS} FROM pq_items WHERE scheduler_id = ? AND status = ? {clause} {QUEUE_ORDER}"
        );
        let mut query = sqlx::query(&sql).bind(scheduler_id).bind(TaskStatus::Queued);
        if let Some(value) = bind {
            query = query.bind(value);
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        rows.iter()
            .map(|row| Self::row_to_item(row).map(|(_, item)| item))
            .collect()
    }
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    #[instrument(skip(self, item), fields(item_id = %item.id, scheduler_id = %item.scheduler_id))]
    async fn upsert(&self, item: &PrioritizedItem) -> SchedulerResult<PrioritizedItem> {
        let context = repo_context!(RepositoryOperation::Upsert, "队列项", id = item.id, scheduler = &item.scheduler_id);

        let hash = item
            .hash
            .as_deref()
            .ok_or_else(|| SchedulerError::InvalidItem("队列项缺少哈希".to_string()))?;
        let priority = item
            .priority
            .ok_or_else(|| SchedulerError::InvalidItem("队列项缺少优先级".to_string()))?;
        let now = MappingHelpers::format_timestamp(&Utc::now());

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pq_items (id, scheduler_id, hash, priority, data, status, created_at, modified_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scheduler_id, hash) WHERE status = 'queued' DO UPDATE SET
                priority = excluded.priority,
                data = excluded.data,
                modified_at = excluded.modified_at
            RETURNING {ITEM_FIELDS}
            "#
        ))
        .bind(item.id.to_string())
        .bind(&item.scheduler_id)
        .bind(hash)
        .bind(priority)
        .bind(MappingHelpers::to_json_text(&item.data)?)
        .bind(TaskStatus::Queued)
        .bind(MappingHelpers::format_timestamp(&item.created_at))
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let (_, stored) = Self::row_to_item(&row)?;
        debug!("队列项已写入: {} (优先级 {})", stored.id, priority);
        Ok(stored)
    }

    #[instrument(skip(self, filters))]
    async fn pop(
        &self,
        scheduler_id: &str,
        filters: Option<&FilterRequest>,
        limit: i64,
    ) -> SchedulerResult<Vec<PrioritizedItem>> {
        let context = repo_context!(RepositoryOperation::Pop, "队列项", scheduler = scheduler_id);

        // 出队即删除，之后以任务记录为准
        let mut builder = QueryBuilder::<Sqlite>::new("DELETE FROM pq_items");
        builder
            .push(" WHERE seq IN (SELECT seq FROM pq_items WHERE scheduler_id = ")
            .push_bind(scheduler_id.to_string())
            .push(" AND status = ")
            .push_bind(TaskStatus::Queued);
        if let Some(filters) = filters {
            push_filters(&mut builder, filters, QUEUE_COLUMNS)?;
        }
        builder
            .push(" ")
            .push(QUEUE_ORDER)
            .push(" LIMIT ")
            .push_bind(limit.max(1))
            .push(") RETURNING ")
            .push(ITEM_FIELDS);

        let rows = builder
            .build()
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        // RETURNING 不保证顺序，按出队顺序重新排序
        let mut popped = rows
            .iter()
            .map(Self::row_to_item)
            .collect::<SchedulerResult<Vec<_>>>()?;
        popped.sort_by(|(seq_a, a), (seq_b, b)| {
            (a.priority, a.created_at, seq_a).cmp(&(b.priority, b.created_at, seq_b))
        });

        let now = Utc::now();
        Ok(popped
            .into_iter()
            .map(|(_, mut item)| {
                item.status = TaskStatus::Dispatched;
                item.modified_at = now;
                item
            })
            .collect())
    }

    async fn peek(
        &self,
        scheduler_id: &str,
        index: i64,
    ) -> SchedulerResult<Option<PrioritizedItem>> {
        let context = repo_context!(RepositoryOperation::Read, "队列项", scheduler = scheduler_id);

        let row = sqlx::query(&format!(
            "SELECT {ITEM_FIELDS} FROM pq_items WHERE scheduler_id = ? AND status = ? {QUEUE_ORDER} LIMIT 1 OFFSET ?"
        ))
        .bind(scheduler_id)
        .bind(TaskStatus::Queued)
        .bind(index.max(0))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        row.as_ref()
            .map(|row| Self::row_to_item(row).map(|(_, item)| item))
            .transpose()
    }

    async fn get_queued_by_hash(
        &self,
        scheduler_id: &str,
        hash: &str,
    ) -> SchedulerResult<Option<PrioritizedItem>> {
        Ok(self
            .fetch_queued(scheduler_id, "AND hash = ?", Some(hash.to_string()))
            .await?
            .into_iter()
            .next())
    }

    async fn list_queued(&self, scheduler_id: &str) -> SchedulerResult<Vec<PrioritizedItem>> {
        self.fetch_queued(scheduler_id, "", None).await
    }

    #[instrument(skip(self))]
    async fn remove(&self, scheduler_id: &str, id: Uuid) -> SchedulerResult<()> {
        let context = repo_context!(RepositoryOperation::Delete, "队列项", id = id, scheduler = scheduler_id);

        let result = sqlx::query("DELETE FROM pq_items WHERE scheduler_id = ? AND id = ?")
            .bind(scheduler_id)
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryErrorHelpers::not_found(&context));
        }
        Ok(())
    }

    #[instrument(skip(self))]
    async fn clear(&self, scheduler_id: &str) -> SchedulerResult<u64> {
        let context = repo_context!(RepositoryOperation::Delete, "队列项", scheduler = scheduler_id);

        let result = sqlx::query("DELETE FROM pq_items WHERE scheduler_id = ? AND status = ?")
            .bind(scheduler_id)
            .bind(TaskStatus::Queued)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        debug!("清空队列 {}: 删除 {} 项", scheduler_id, result.rows_affected());
        Ok(result.rows_affected())
    }

    async fn qsize(&self, scheduler_id: &str) -> SchedulerResult<i64> {
        let context = repo_context!(RepositoryOperation::Query, "队列项", scheduler = scheduler_id);

        let row = sqlx::query(
            "SELECT COUNT(*) AS size FROM pq_items WHERE scheduler_id = ? AND status = ?",
        )
        .bind(scheduler_id)
        .bind(TaskStatus::Queued)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        Ok(row.try_get("size")?)
    }
}
