pub mod cache;
pub mod clients;
pub mod database;
pub mod error_handling;
pub mod events;
pub mod observability;

pub use cache::*;
pub use clients::*;
pub use database::*;
pub use error_handling::{OperationContext, RepositoryErrorHelpers, RepositoryOperation};
pub use events::{EventBus, EventReceiver, EventTopic, SchedulerEvent};
pub use observability::*;
