use anyhow::{Context, Result};
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::{
    api_observability::{ApiConfig, ObservabilityConfig},
    database::DatabaseConfig,
    scheduler::SchedulerConfig,
    services::ServicesConfig,
};

/// System configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database: DatabaseConfig,
    pub scheduler: SchedulerConfig,
    pub services: ServicesConfig,
    pub api: ApiConfig,
    pub observability: ObservabilityConfig,
}

impl AppConfig {
    /// Load configuration from config file and environment variables
    ///
    /// Load order:
    /// 1. Default configuration
    /// 2. Config file (TOML format)
    /// 3. Environment variable overrides (prefix: SCHEDULER_, nesting: __)
    ///
    /// e.g. `SCHEDULER_SCHEDULER__PQ_MAXSIZE=500`
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let defaults =
            ConfigBuilder::try_from(&AppConfig::default()).context("构建默认配置失败")?;
        let mut builder = ConfigBuilder::builder().add_source(defaults);

        if let Some(path) = config_path {
            if Path::new(path).exists() {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            } else {
                return Err(anyhow::anyhow!("配置文件不存在: {}", path));
            }
        } else {
            let default_paths = [
                "config/scheduler.toml",
                "scheduler.toml",
                "/etc/scheduler/config.toml",
            ];

            if let Some(path) = default_paths.iter().find(|p| Path::new(p).exists()) {
                builder = builder.add_source(File::new(path, FileFormat::Toml));
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("SCHEDULER")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .context("构建配置失败")?
            .try_deserialize()
            .context("反序列化配置失败")?;

        config.validate()?;

        Ok(config)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: AppConfig = toml::from_str(toml_str).context("解析TOML配置失败")?;

        config.validate()?;
        Ok(config)
    }

    /// Serialize configuration to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("序列化配置为TOML失败")
    }

    pub fn validate(&self) -> Result<()> {
        self.database.validate().context("数据库配置验证失败")?;
        self.scheduler.validate().context("调度器配置验证失败")?;
        self.services.validate().context("外部服务配置验证失败")?;
        self.api.validate().context("API配置验证失败")?;
        self.observability
            .validate()
            .context("可观测性配置验证失败")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scheduler.pq_maxsize, 1000);
        assert_eq!(config.scheduler.push_max_tries, 5);
        assert_eq!(config.services.cache_ttl_seconds, 30);
    }

    #[test]
    fn test_from_toml_partial_sections() {
        let config = AppConfig::from_toml(
            r#"
            [scheduler]
            pq_maxsize = 25
            pq_grace_period_seconds = 600

            [services]
            catalog_url = "http://catalog:8000"
            "#,
        )
        .unwrap();

        assert_eq!(config.scheduler.pq_maxsize, 25);
        assert_eq!(config.scheduler.pq_grace_period_seconds, 600);
        // 未指定的字段保留默认值
        assert_eq!(config.scheduler.reschedule_interval_seconds, 60);
        assert_eq!(config.services.catalog_url, "http://catalog:8000");
        assert_eq!(config.database.max_connections, 10);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let result = AppConfig::from_toml(
            r#"
            [scheduler]
            push_max_tries = -3
            "#,
        );
        assert!(result.is_err());

        let result = AppConfig::from_toml(
            r#"
            [database]
            url = "postgresql://localhost/scheduler"
            "#,
        );
        assert!(result.is_err());

        let result = AppConfig::from_toml(
            r#"
            [services]
            object_store_url = "octopoes:8001"
            "#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file_and_roundtrip() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [api]
            bind_address = "127.0.0.1:9000"

            [scheduler]
            worker_pool_size = 4
            "#
        )
        .unwrap();

        let path = file.path().to_str().unwrap().to_string();
        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.api.bind_address, "127.0.0.1:9000");
        assert_eq!(config.scheduler.worker_pool_size, 4);

        let serialized = config.to_toml().unwrap();
        let reparsed = AppConfig::from_toml(&serialized).unwrap();
        assert_eq!(reparsed.scheduler.worker_pool_size, 4);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let result = AppConfig::load(Some("/nonexistent/scheduler.toml"));
        assert!(result.is_err());
    }
}
