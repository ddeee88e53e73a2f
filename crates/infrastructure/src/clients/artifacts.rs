use async_trait::async_trait;
use scheduler_core::{SchedulerResult, ServicesConfig};
use scheduler_domain::{payloads::LastRun, services::ArtifactService};
use tracing::instrument;

use super::http::HttpService;

/// 原始数据存储服务客户端
#[derive(Debug, Clone)]
pub struct ArtifactClient {
    http: HttpService,
}

impl ArtifactClient {
    pub fn new(config: &ServicesConfig) -> SchedulerResult<Self> {
        Ok(Self {
            http: HttpService::new("artifact_store", &config.artifact_store_url, config)?,
        })
    }
}

#[async_trait]
impl ArtifactService for ArtifactClient {
    /// 查询插件针对某目标最近一次运行的记录
    #[instrument(skip(self))]
    async fn get_last_run(
        &self,
        plugin_id: &str,
        input_object: Option<&str>,
        organisation: &str,
    ) -> SchedulerResult<Option<LastRun>> {
        let mut query = vec![
            ("plugin_id", plugin_id.to_string()),
            ("organisation", organisation.to_string()),
            ("limit", "1".to_string()),
            ("descending", "true".to_string()),
        ];
        if let Some(input) = input_object {
            query.push(("input_object", input.to_string()));
        }

        let runs: Option<Vec<LastRun>> = self.http.get_optional("runs", &query).await?;
        Ok(runs.and_then(|runs| runs.into_iter().next()))
    }
}
