use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use scheduler_core::{DatabaseConfig, SchedulerError, SchedulerResult};
use scheduler_domain::repositories::{QueueStore, ScheduleRepository, TaskRepository};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use tracing::{debug, info};

use super::sqlite::{SqliteQueueStore, SqliteScheduleRepository, SqliteTaskRepository};

/// SQLite 连接池与仓储工厂
#[derive(Clone)]
pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let manager = Self::connect_with(
            &config.url,
            config.max_connections,
            config.min_connections,
            Duration::from_secs(config.connection_timeout_seconds),
            Duration::from_secs(config.idle_timeout_seconds),
        )
        .await?;
        manager.migrate().await?;
        Ok(manager)
    }

    pub async fn connect(url: &str, max_connections: u32) -> SchedulerResult<Self> {
        Self::connect_with(
            url,
            max_connections,
            1,
            Duration::from_secs(30),
            Duration::from_secs(600),
        )
        .await
    }

    async fn connect_with(
        url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
        idle_timeout: Duration,
    ) -> SchedulerResult<Self> {
        let in_memory = url.contains(":memory:") || url.contains("mode=memory");

        let mut options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 内存库每个连接都是独立的数据库，只能用单连接
        let (max, min) = if in_memory {
            (1, 1)
        } else {
            (max_connections, min_connections.min(max_connections))
        };

        let mut pool_options = SqlitePoolOptions::new()
            .max_connections(max)
            .min_connections(min)
            .acquire_timeout(acquire_timeout);
        if in_memory {
            pool_options = pool_options.idle_timeout(None).max_lifetime(None);
        } else {
            pool_options = pool_options.idle_timeout(idle_timeout);
        }

        let pool = pool_options.connect_with(options).await?;
        debug!("数据库连接池已建立: 最大连接数 {}", max);
        Ok(Self { pool })
    }

    /// 内存数据库，已完成迁移
    pub async fn in_memory() -> SchedulerResult<Self> {
        let manager = Self::connect("sqlite::memory:", 1).await?;
        manager.migrate().await?;
        Ok(manager)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// 运行数据库迁移
    pub async fn migrate(&self) -> SchedulerResult<()> {
        debug!("Running SQLite database migrations");

        // 任务表：每次执行尝试一行，历史保留用于去重与宽限期判断
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                scheduler_id TEXT NOT NULL,
                organisation TEXT NOT NULL,
                task_type TEXT NOT NULL,
                hash TEXT NOT NULL,
                priority INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL DEFAULT 'pending',
                data TEXT NOT NULL DEFAULT '{}',
                deduplication_key TEXT,
                meta TEXT,
                pending REAL,
                queued REAL,
                dispatched REAL,
                running REAL,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // 调度记录表：以内容哈希为身份
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS schedules (
                id TEXT PRIMARY KEY,
                scheduler_id TEXT NOT NULL,
                organisation TEXT NOT NULL,
                hash TEXT NOT NULL UNIQUE,
                data TEXT NOT NULL DEFAULT '{}',
                schedule TEXT,
                interval_seconds INTEGER,
                enabled INTEGER NOT NULL DEFAULT 1,
                deadline_at TEXT,
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        // 队列表：seq 保证同优先级、同创建时间的条目按插入顺序出队
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pq_items (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                scheduler_id TEXT NOT NULL,
                hash TEXT NOT NULL,
                priority INTEGER NOT NULL,
                data TEXT NOT NULL DEFAULT '{}',
                status TEXT NOT NULL DEFAULT 'queued',
                created_at TEXT NOT NULL,
                modified_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        let indexes = [
            "CREATE INDEX IF NOT EXISTS idx_tasks_hash_created ON tasks(hash, created_at)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_scheduler_status ON tasks(scheduler_id, status)",
            "CREATE INDEX IF NOT EXISTS idx_tasks_created_at ON tasks(created_at)",
            "CREATE INDEX IF NOT EXISTS idx_schedules_scheduler_deadline ON schedules(scheduler_id, enabled, deadline_at)",
            "CREATE UNIQUE INDEX IF NOT EXISTS ux_pq_items_queued_hash ON pq_items(scheduler_id, hash) WHERE status = 'queued'",
            "CREATE INDEX IF NOT EXISTS idx_pq_items_order ON pq_items(scheduler_id, status, priority, created_at, seq)",
        ];

        for index_sql in indexes {
            sqlx::query(index_sql).execute(&self.pool).await?;
        }

        info!("数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(SchedulerError::Database)?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await
    }

    pub fn task_repository(&self) -> Arc<dyn TaskRepository> {
        Arc::new(SqliteTaskRepository::new(self.pool.clone()))
    }

    pub fn schedule_repository(&self) -> Arc<dyn ScheduleRepository> {
        Arc::new(SqliteScheduleRepository::new(self.pool.clone()))
    }

    pub fn queue_store(&self) -> Arc<dyn QueueStore> {
        Arc::new(SqliteQueueStore::new(self.pool.clone()))
    }
}
