use async_trait::async_trait;
use chrono::{DateTime, Utc};
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    entities::Schedule,
    repositories::{ScheduleQuery, ScheduleRepository, DEFAULT_PAGE_LIMIT},
};
use sqlx::{sqlite::SqliteRow, QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::{
    database::{
        filter_sql::{push_filters, SCHEDULE_COLUMNS},
        mapping::MappingHelpers,
    },
    error_handling::{RepositoryErrorHelpers, RepositoryOperation},
    repo_context,
};

const SCHEDULE_FIELDS: &str = "id, scheduler_id, organisation, hash, data, schedule, interval_seconds, enabled, deadline_at, created_at, modified_at";

pub struct SqliteScheduleRepository {
    pool: SqlitePool,
}

impl SqliteScheduleRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn row_to_schedule(row: &SqliteRow) -> SchedulerResult<Schedule> {
        Ok(Schedule {
            id: MappingHelpers::get_uuid(row, "id")?,
            scheduler_id: row.try_get("scheduler_id")?,
            organisation: row.try_get("organisation")?,
            hash: row.try_get("hash")?,
            data: MappingHelpers::get_json(row, "data")?,
            schedule: row.try_get("schedule")?,
            interval_seconds: row.try_get("interval_seconds")?,
            enabled: row.try_get("enabled")?,
            deadline_at: MappingHelpers::get_optional_timestamp(row, "deadline_at")?,
            created_at: MappingHelpers::get_timestamp(row, "created_at")?,
            modified_at: MappingHelpers::get_timestamp(row, "modified_at")?,
        })
    }

    fn push_conditions(
        builder: &mut QueryBuilder<'_, Sqlite>,
        query: &ScheduleQuery,
    ) -> SchedulerResult<()> {
        builder.push(" WHERE 1 = 1");
        if let Some(scheduler_id) = &query.scheduler_id {
            builder.push(" AND scheduler_id = ").push_bind(scheduler_id.clone());
        }
        if let Some(hash) = &query.hash {
            builder.push(" AND hash = ").push_bind(hash.clone());
        }
        if let Some(enabled) = query.enabled {
            builder.push(" AND enabled = ").push_bind(enabled);
        }
        if let Some(min) = &query.min_deadline_at {
            builder
                .push(" AND deadline_at >= ")
                .push_bind(MappingHelpers::format_timestamp(min));
        }
        if let Some(max) = &query.max_deadline_at {
            builder
                .push(" AND deadline_at <= ")
                .push_bind(MappingHelpers::format_timestamp(max));
        }
        if let Some(filters) = &query.filters {
            push_filters(builder, filters, SCHEDULE_COLUMNS)?;
        }
        Ok(())
    }

    async fn fetch_one_where(&self, column: &str, value: String) -> SchedulerResult<Option<Schedule>> {
        let context = repo_context!(RepositoryOperation::Read, "调度记录", id = &value);

        let row = sqlx::query(&format!("SELECT {SCHEDULE_FIELDS} FROM schedules WHERE {column} = ?"))
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        row.as_ref().map(Self::row_to_schedule).transpose()
    }
}

#[async_trait]
impl ScheduleRepository for SqliteScheduleRepository {
    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id, hash = %schedule.hash))]
    async fn create(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let context = repo_context!(RepositoryOperation::Create, "调度记录", id = schedule.id, scheduler = &schedule.scheduler_id);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO schedules ({SCHEDULE_FIELDS})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            RETURNING {SCHEDULE_FIELDS}
            "#
        ))
        .bind(schedule.id.to_string())
        .bind(&schedule.scheduler_id)
        .bind(&schedule.organisation)
        .bind(&schedule.hash)
        .bind(MappingHelpers::to_json_text(&schedule.data)?)
        .bind(&schedule.schedule)
        .bind(schedule.interval_seconds)
        .bind(schedule.enabled)
        .bind(schedule.deadline_at.as_ref().map(MappingHelpers::format_timestamp))
        .bind(MappingHelpers::format_timestamp(&schedule.created_at))
        .bind(MappingHelpers::format_timestamp(&schedule.modified_at))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        RepositoryErrorHelpers::log_operation_success(&context, None);
        Self::row_to_schedule(&row)
    }

    #[instrument(skip(self, schedule), fields(schedule_id = %schedule.id, enabled = schedule.enabled))]
    async fn update(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let context = repo_context!(RepositoryOperation::Update, "调度记录", id = schedule.id);

        let row = sqlx::query(&format!(
            r#"
            UPDATE schedules
            SET data = ?, schedule = ?, interval_seconds = ?, enabled = ?, deadline_at = ?, modified_at = ?
            WHERE id = ?
            RETURNING {SCHEDULE_FIELDS}
            "#
        ))
        .bind(MappingHelpers::to_json_text(&schedule.data)?)
        .bind(&schedule.schedule)
        .bind(schedule.interval_seconds)
        .bind(schedule.enabled)
        .bind(schedule.deadline_at.as_ref().map(MappingHelpers::format_timestamp))
        .bind(MappingHelpers::format_timestamp(&Utc::now()))
        .bind(schedule.id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        match row {
            Some(row) => {
                RepositoryErrorHelpers::log_operation_success(&context, None);
                Self::row_to_schedule(&row)
            }
            None => Err(RepositoryErrorHelpers::not_found(&context)),
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, id: Uuid) -> SchedulerResult<()> {
        let context = repo_context!(RepositoryOperation::Delete, "调度记录", id = id);

        let result = sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryErrorHelpers::not_found(&context));
        }
        RepositoryErrorHelpers::log_operation_success(&context, None);
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> SchedulerResult<Option<Schedule>> {
        self.fetch_one_where("id", id.to_string()).await
    }

    async fn get_by_hash(&self, hash: &str) -> SchedulerResult<Option<Schedule>> {
        self.fetch_one_where("hash", hash.to_string()).await
    }

    #[instrument(skip(self, query))]
    async fn list(&self, query: &ScheduleQuery) -> SchedulerResult<(Vec<Schedule>, i64)> {
        let context = repo_context!(RepositoryOperation::Query, "调度记录");

        let mut count = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS total FROM schedules");
        Self::push_conditions(&mut count, query)?;
        let total: i64 = count
            .build()
            .fetch_one(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?
            .try_get("total")?;

        let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT {SCHEDULE_FIELDS} FROM schedules"));
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

        let schedules = rows
            .iter()
            .map(Self::row_to_schedule)
            .collect::<SchedulerResult<Vec<_>>>()?;
        Ok((schedules, total))
    }

    #[instrument(skip(self))]
    async fn get_expired(
        &self,
        scheduler_id: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Vec<Schedule>> {
        let context = repo_context!(RepositoryOperation::Query, "调度记录", scheduler = scheduler_id);

        let rows = sqlx::query(&format!(
            "SELECT {SCHEDULE_FIELDS} FROM schedules WHERE scheduler_id = ? AND enabled = 1 AND deadline_at IS NOT NULL AND deadline_at < ? ORDER BY deadline_at ASC"
        ))
        .bind(scheduler_id)
        .bind(MappingHelpers::format_timestamp(&now))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        let schedules = rows
            .iter()
            .map(Self::row_to_schedule)
            .collect::<SchedulerResult<Vec<_>>>()?;
        debug!("调度器 {} 有 {} 条到期的调度记录", scheduler_id, schedules.len());
        Ok(schedules)
    }

    /// 单条语句完成插入或更新，已存在的记录保留 id 并重新启用；
    /// 未提供的周期与截止时间沿用已有值
    #[instrument(skip(self, schedule), fields(hash = %schedule.hash))]
    async fn upsert_by_hash(&self, schedule: &Schedule) -> SchedulerResult<Schedule> {
        let context = repo_context!(RepositoryOperation::Upsert, "调度记录", id = &schedule.hash, scheduler = &schedule.scheduler_id);

        let row = sqlx::query(&format!(
            r#"
            INSERT INTO schedules ({SCHEDULE_FIELDS})
            VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?)
            ON CONFLICT(hash) DO UPDATE SET
                data = excluded.data,
                schedule = COALESCE(excluded.schedule, schedules.schedule),
                interval_seconds = COALESCE(excluded.interval_seconds, schedules.interval_seconds),
                enabled = 1,
                deadline_at = COALESCE(excluded.deadline_at, schedules.deadline_at),
                modified_at = excluded.modified_at
            RETURNING {SCHEDULE_FIELDS}
            "#
        ))
        .bind(schedule.id.to_string())
        .bind(&schedule.scheduler_id)
        .bind(&schedule.organisation)
        .bind(&schedule.hash)
        .bind(MappingHelpers::to_json_text(&schedule.data)?)
        .bind(&schedule.schedule)
        .bind(schedule.interval_seconds)
        .bind(schedule.deadline_at.as_ref().map(MappingHelpers::format_timestamp))
        .bind(MappingHelpers::format_timestamp(&schedule.created_at))
        .bind(MappingHelpers::format_timestamp(&Utc::now()))
        .fetch_one(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(&context, e))?;

        RepositoryErrorHelpers::log_operation_success(&context, None);
        Self::row_to_schedule(&row)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::DatabaseManager;
    use chrono::Duration;
    use serde_json::json;

    async fn setup() -> (DatabaseManager, SqliteScheduleRepository) {
        let manager = DatabaseManager::in_memory().await.unwrap();
        let repo = SqliteScheduleRepository::new(manager.pool().clone());
        (manager, repo)
    }

    #[tokio::test]
    async fn test_upsert_reenables_and_keeps_id() {
        let (_db, repo) = setup().await;
        let mut schedule = Schedule::new("scan-org1", "org1", "h1", json!({"v": 1}));
        schedule.interval_seconds = Some(3600);
        let first = repo.upsert_by_hash(&schedule).await.unwrap();

        let mut disabled = first.clone();
        disabled.enabled = false;
        repo.update(&disabled).await.unwrap();

        let mut again = Schedule::new("scan-org1", "org1", "h1", json!({"v": 2}));
        again.deadline_at = Some(Utc::now() + Duration::hours(1));
        let second = repo.upsert_by_hash(&again).await.unwrap();

        assert_eq!(second.id, first.id);
        assert!(second.enabled);
        assert_eq!(second.data, json!({"v": 2}));
        assert!(second.deadline_at.is_some());
        // 未提供间隔时保留已有值
        assert_eq!(second.interval_seconds, Some(3600));
    }

    #[tokio::test]
    async fn test_expired_only_enabled_past_deadline() {
        let (_db, repo) = setup().await;
        let now = Utc::now();

        let mut past = Schedule::new("report-org1", "org1", "past", json!({}));
        past.deadline_at = Some(now - Duration::minutes(5));
        repo.create(&past).await.unwrap();

        let mut future = Schedule::new("report-org1", "org1", "future", json!({}));
        future.deadline_at = Some(now + Duration::minutes(5));
        repo.create(&future).await.unwrap();

        let mut off = Schedule::new("report-org1", "org1", "off", json!({}));
        off.deadline_at = Some(now - Duration::minutes(5));
        off.enabled = false;
        repo.create(&off).await.unwrap();

        let expired = repo.get_expired("report-org1", now).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].hash, "past");
    }

    #[tokio::test]
    async fn test_duplicate_hash_and_delete() {
        let (_db, repo) = setup().await;
        let created = repo
            .create(&Schedule::new("scan-org1", "org1", "h1", json!({})))
            .await
            .unwrap();

        let err = repo
            .create(&Schedule::new("scan-org1", "org1", "h1", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, scheduler_core::SchedulerError::NotAllowed(_)));

        assert_eq!(repo.get_by_hash("h1").await.unwrap().unwrap().id, created.id);
        repo.delete(created.id).await.unwrap();
        assert!(repo.get_by_id(created.id).await.unwrap().is_none());
        assert!(repo.delete(created.id).await.is_err());
    }

    #[tokio::test]
    async fn test_list_filters() {
        let (_db, repo) = setup().await;
        for (hash, plugin) in [("a", "dns"), ("b", "nmap")] {
            repo.create(&Schedule::new("scan-org1", "org1", hash, json!({"plugin": {"id": plugin}})))
                .await
                .unwrap();
        }

        let query = ScheduleQuery {
            filters: Some(serde_json::from_value(json!({
                "filters": [{"column": "data", "field": "plugin__id", "value": "nmap"}]
            })).unwrap()),
            ..Default::default()
        };
        let (schedules, total) = repo.list(&query).await.unwrap();
        assert_eq!(total, 1);
        assert_eq!(schedules[0].hash, "b");

        let (_, enabled_total) = repo
            .list(&ScheduleQuery {
                enabled: Some(true),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(enabled_total, 2);
    }
}
