//! In-memory SQLite stores built through the production migrations

use std::sync::Arc;

use scheduler_domain::{QueueStore, ScheduleRepository, TaskRepository};
use scheduler_infrastructure::DatabaseManager;

/// Migrated in-memory database (single-connection pool)
pub async fn in_memory_db() -> DatabaseManager {
    DatabaseManager::in_memory()
        .await
        .expect("failed to create in-memory database")
}

pub async fn in_memory_queue_store() -> Arc<dyn QueueStore> {
    in_memory_db().await.queue_store()
}

/// All three stores sharing one database
pub struct TestStores {
    pub db: DatabaseManager,
    pub tasks: Arc<dyn TaskRepository>,
    pub schedules: Arc<dyn ScheduleRepository>,
    pub queue: Arc<dyn QueueStore>,
}

impl TestStores {
    pub async fn new() -> Self {
        let db = in_memory_db().await;
        Self {
            tasks: db.task_repository(),
            schedules: db.schedule_repository(),
            queue: db.queue_store(),
            db,
        }
    }
}
