//! 配置管理
//!
//! 配置加载顺序：默认值 → TOML 文件 → `SCHEDULER_` 前缀的环境变量。

pub mod models;

pub use models::*;
