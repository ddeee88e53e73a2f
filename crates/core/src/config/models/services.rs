use serde::{Deserialize, Serialize};

/// 外部服务（插件目录、对象存储、原始数据存储）连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub catalog_url: String,
    pub object_store_url: String,
    pub artifact_store_url: String,
    pub request_timeout_seconds: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub cache_ttl_seconds: u64,
    pub user_agent: String,
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            catalog_url: "http://localhost:8003".to_string(),
            object_store_url: "http://localhost:8001".to_string(),
            artifact_store_url: "http://localhost:8002".to_string(),
            request_timeout_seconds: 10,
            max_retries: 3,
            retry_backoff_ms: 500,
            cache_ttl_seconds: 30,
            user_agent: format!("scan-scheduler/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl ServicesConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, url) in [
            ("catalog_url", &self.catalog_url),
            ("object_store_url", &self.object_store_url),
            ("artifact_store_url", &self.artifact_store_url),
        ] {
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(anyhow::anyhow!("{name} 必须是HTTP(S)地址: {url}"));
            }
        }

        if self.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("请求超时时间必须大于0"));
        }

        Ok(())
    }
}
