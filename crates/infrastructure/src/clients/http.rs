//! 外部 REST 服务的通用 HTTP 客户端
//!
//! 对 500/502/503/504 与连接错误按指数退避重试，
//! 所有失败都归为 `ExternalService` 错误。

use std::time::Duration;

use reqwest::StatusCode;
use scheduler_core::{SchedulerError, SchedulerResult, ServicesConfig};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

const RETRY_STATUSES: [StatusCode; 4] = [
    StatusCode::INTERNAL_SERVER_ERROR,
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];

#[derive(Debug, Clone)]
pub struct HttpService {
    name: &'static str,
    host: String,
    client: reqwest::Client,
    max_retries: u32,
    retry_backoff: Duration,
}

impl HttpService {
    pub fn new(name: &'static str, host: &str, config: &ServicesConfig) -> SchedulerResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SchedulerError::external(name, format!("创建HTTP客户端失败: {e}")))?;

        Ok(Self {
            name,
            host: host.trim_end_matches('/').to_string(),
            client,
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}/{}", self.host, path.trim_start_matches('/'))
    }

    /// GET 并解析 JSON；404 返回 None
    pub async fn get_optional<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> SchedulerResult<Option<T>> {
        let url = self.url(path);
        let mut attempt = 0;

        loop {
            let result = self.client.get(&url).query(query).send().await;
            debug!("Made GET request [name={}, url={}, attempt={}]", self.name, url, attempt);

            let retryable = match result {
                Ok(response) if response.status() == StatusCode::NOT_FOUND => return Ok(None),
                Ok(response) if response.status().is_success() => {
                    let body = response
                        .json::<T>()
                        .await
                        .map_err(|e| SchedulerError::external(self.name, format!("响应解析失败 {url}: {e}")))?;
                    return Ok(Some(body));
                }
                Ok(response) if RETRY_STATUSES.contains(&response.status()) => {
                    format!("HTTP {}", response.status())
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(SchedulerError::external(
                        self.name,
                        format!("请求 {url} 失败: HTTP {status} - {body}"),
                    ));
                }
                Err(e) if e.is_connect() || e.is_timeout() => e.to_string(),
                Err(e) => {
                    return Err(SchedulerError::external(self.name, format!("请求 {url} 失败: {e}")));
                }
            };

            if attempt >= self.max_retries {
                return Err(SchedulerError::external(
                    self.name,
                    format!("请求 {url} 在 {} 次重试后失败: {retryable}", self.max_retries),
                ));
            }

            let delay = self.retry_backoff * 2u32.saturating_pow(attempt);
            warn!(
                "服务 {} 暂时不可用，{}ms 后重试: {}",
                self.name,
                delay.as_millis(),
                retryable
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> SchedulerResult<T> {
        self.get_optional(path, query)
            .await?
            .ok_or_else(|| SchedulerError::external(self.name, format!("资源不存在: {}", self.url(path))))
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        self.get_optional::<serde_json::Value>("health", &[]).await?;
        Ok(())
    }
}
