pub mod app;
pub mod shutdown;

pub use app::{AppMode, Application, ExternalServices};
pub use shutdown::ShutdownManager;
