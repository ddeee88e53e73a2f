use std::collections::HashMap;

use async_trait::async_trait;
use scheduler_core::{SchedulerError, SchedulerResult, ServicesConfig};
use scheduler_domain::{
    entities::Organisation,
    payloads::Plugin,
    services::CatalogService,
};
use tracing::instrument;

use super::http::HttpService;

/// 插件目录服务客户端（无缓存）
#[derive(Debug, Clone)]
pub struct CatalogClient {
    http: HttpService,
}

impl CatalogClient {
    pub fn new(config: &ServicesConfig) -> SchedulerResult<Self> {
        Ok(Self {
            http: HttpService::new("catalog", &config.catalog_url, config)?,
        })
    }
}

/// 租户列表可能以数组或以 id 为键的对象返回
#[derive(serde::Deserialize)]
#[serde(untagged)]
enum OrganisationsBody {
    List(Vec<Organisation>),
    Map(HashMap<String, Organisation>),
}

#[async_trait]
impl CatalogService for CatalogClient {
    #[instrument(skip(self))]
    async fn get_organisations(&self) -> SchedulerResult<Vec<Organisation>> {
        let body: OrganisationsBody = self.http.get_json("v1/organisations", &[]).await?;
        let mut organisations = match body {
            OrganisationsBody::List(list) => list,
            OrganisationsBody::Map(map) => map.into_values().collect(),
        };
        organisations.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(organisations)
    }

    #[instrument(skip(self))]
    async fn get_plugins(&self, organisation: &str) -> SchedulerResult<Vec<Plugin>> {
        self.http
            .get_json(&format!("v1/organisations/{organisation}/plugins"), &[])
            .await
    }

    #[instrument(skip(self))]
    async fn get_plugin(
        &self,
        plugin_id: &str,
        organisation: &str,
    ) -> SchedulerResult<Option<Plugin>> {
        if plugin_id.is_empty() {
            return Err(SchedulerError::InvalidItem("插件ID不能为空".to_string()));
        }
        self.http
            .get_optional(
                &format!("v1/organisations/{organisation}/plugins/{plugin_id}"),
                &[],
            )
            .await
    }
}
