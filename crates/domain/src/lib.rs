pub mod entities;
pub mod events;
pub mod filters;
pub mod payloads;
pub mod repositories;
pub mod services;

// SQLx 实现（仅在启用 sqlx-support feature 时编译）
#[cfg(feature = "sqlx-support")]
pub mod sqlx_impls;

pub use entities::*;
pub use events::*;
pub use filters::*;
pub use payloads::*;
pub use repositories::*;
pub use scheduler_core::{SchedulerError, SchedulerResult};
pub use services::*;
