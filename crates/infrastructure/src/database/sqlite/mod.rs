pub mod sqlite_queue_store;
pub mod sqlite_schedule_repository;
pub mod sqlite_task_repository;

pub use sqlite_queue_store::SqliteQueueStore;
pub use sqlite_schedule_repository::SqliteScheduleRepository;
pub use sqlite_task_repository::SqliteTaskRepository;
