//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the scheduler workspace: mock external
//! services, test data builders and in-memory stores.
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod database;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
