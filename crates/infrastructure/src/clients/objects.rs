use async_trait::async_trait;
use scheduler_core::{SchedulerResult, ServicesConfig};
use scheduler_domain::{payloads::ScanObject, services::ObjectService};
use tracing::instrument;

use super::http::HttpService;

/// 对象存储服务客户端
#[derive(Debug, Clone)]
pub struct ObjectClient {
    http: HttpService,
}

impl ObjectClient {
    pub fn new(config: &ServicesConfig) -> SchedulerResult<Self> {
        Ok(Self {
            http: HttpService::new("object_store", &config.object_store_url, config)?,
        })
    }
}

fn repeated(key: &'static str, values: impl IntoIterator<Item = String>) -> Vec<(&'static str, String)> {
    values.into_iter().map(|v| (key, v)).collect()
}

#[async_trait]
impl ObjectService for ObjectClient {
    #[instrument(skip(self))]
    async fn get_objects_by_types(
        &self,
        organisation: &str,
        object_types: &[String],
        scan_levels: &[i32],
    ) -> SchedulerResult<Vec<ScanObject>> {
        let mut query = repeated("types", object_types.iter().cloned());
        query.extend(repeated("scan_level", scan_levels.iter().map(i32::to_string)));
        self.http
            .get_json(&format!("{organisation}/objects"), &query)
            .await
    }

    #[instrument(skip(self))]
    async fn get_object(
        &self,
        organisation: &str,
        primary_key: &str,
    ) -> SchedulerResult<Option<ScanObject>> {
        self.http
            .get_optional(
                &format!("{organisation}/object"),
                &[("reference", primary_key.to_string())],
            )
            .await
    }

    #[instrument(skip(self))]
    async fn get_random_objects(
        &self,
        organisation: &str,
        count: usize,
        scan_levels: &[i32],
    ) -> SchedulerResult<Vec<ScanObject>> {
        let mut query = vec![("amount", count.to_string())];
        query.extend(repeated("scan_level", scan_levels.iter().map(i32::to_string)));
        self.http
            .get_json(&format!("{organisation}/objects/random"), &query)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clients::test_server::serve;
    use axum::{extract::RawQuery, routing::get, Json, Router};
    use serde_json::json;

    #[tokio::test]
    async fn test_query_parameters_are_repeated() {
        let router = Router::new()
            .route(
                "/org1/objects",
                get(|RawQuery(query): RawQuery| async move {
                    let query = query.unwrap_or_default();
                    assert!(query.contains("types=Hostname"));
                    assert!(query.contains("types=IPAddressV4"));
                    assert!(query.contains("scan_level=2"));
                    Json(json!([{"primary_key": "Hostname|internet|a.example", "object_type": "Hostname", "scan_level": 2}]))
                }),
            )
            .route(
                "/org1/objects/random",
                get(|| async { Json(json!([])) }),
            );
        let host = serve(router).await;
        let client = ObjectClient::new(&ServicesConfig {
            object_store_url: host,
            ..ServicesConfig::default()
        })
        .unwrap();

        let objects = client
            .get_objects_by_types("org1", &["Hostname".into(), "IPAddressV4".into()], &[2, 3])
            .await
            .unwrap();
        assert_eq!(objects[0].scan_level, Some(2));

        assert!(client.get_random_objects("org1", 5, &[1]).await.unwrap().is_empty());
        assert!(client.get_object("org1", "missing").await.unwrap().is_none());
    }
}
