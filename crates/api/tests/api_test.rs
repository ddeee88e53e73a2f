use std::sync::Arc;

use axum::{
    body::Body,
    http::{header, HeaderMap, Method, Request, StatusCode},
    Router,
};
use serde_json::{json, Value};
use tower::ServiceExt;

use scheduler_api::{create_app, routes::AppState};
use scheduler_core::{ApiConfig, SchedulerConfig};
use scheduler_dispatcher::{SchedulerContext, SchedulerRegistry};
use scheduler_domain::{ReportTask, ScanTask, TaskPayload};
use scheduler_infrastructure::{EventBus, EventTopic, MetricsCollector};
use scheduler_testing_utils::database::TestStores;
use scheduler_testing_utils::{
    MockArtifactService, MockCatalogService, MockObjectService, MutationBuilder, PluginBuilder,
    ScanObjectBuilder, TestEnv,
};

struct TestApp {
    router: Router,
    events: Arc<EventBus>,
}

impl TestApp {
    async fn spawn() -> Self {
        Self::spawn_with(TestEnv::scheduler_config()).await
    }

    async fn spawn_with(config: SchedulerConfig) -> Self {
        let stores = TestStores::new().await;
        let events = Arc::new(EventBus::default());
        let ctx = SchedulerContext {
            config,
            task_repo: stores.tasks.clone(),
            schedule_repo: stores.schedules.clone(),
            queue_store: stores.queue.clone(),
            catalog: Arc::new(MockCatalogService::with_organisations(&["org1"])),
            objects: Arc::new(MockObjectService::new()),
            artifacts: Arc::new(MockArtifactService::new()),
            events: events.clone(),
            metrics: MetricsCollector::disabled(),
        };

        let registry = Arc::new(SchedulerRegistry::new());
        registry.add_organisation(&ctx, "org1").await;

        let state = AppState {
            registry,
            task_repo: stores.tasks.clone(),
            schedule_repo: stores.schedules.clone(),
            events: events.clone(),
            metrics: MetricsCollector::disabled(),
            database: Some(stores.db.clone()),
            default_schedule_interval: chrono::Duration::hours(24),
        };

        Self {
            router: create_app(state, &ApiConfig::default()),
            events,
        }
    }

    async fn send(&self, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, value)
    }
}

fn scan_payload(target: &str) -> Value {
    let plugin = PluginBuilder::scan("dns-records").consumes(&["Hostname"]).build();
    serde_json::to_value(ScanTask::new(&plugin, Some(target.to_string()), "org1")).unwrap()
}

#[tokio::test]
async fn test_health_check() {
    let app = TestApp::spawn().await;
    let (status, _, body) = app.send(Method::GET, "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "ok");
    assert_eq!(body["schedulers"], 3);
}

#[tokio::test]
async fn test_metrics_disabled() {
    let app = TestApp::spawn().await;
    let (status, _, _) = app.send(Method::GET, "/metrics", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_list_and_get_schedulers() {
    let app = TestApp::spawn().await;

    let (status, _, body) = app.send(Method::GET, "/schedulers", None).await;
    assert_eq!(status, StatusCode::OK);
    let ids: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|s| s["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["post-process-org1", "report-org1", "scan-org1"]);

    let (status, _, body) = app.send(Method::GET, "/schedulers/scan-org1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["priority_queue"]["size"], 0);

    let (status, _, body) = app.send(Method::GET, "/schedulers/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"]["type"], "NOT_FOUND");
}

#[tokio::test]
async fn test_patch_scheduler() {
    let app = TestApp::spawn().await;

    let (status, _, _) = app
        .send(Method::PATCH, "/schedulers/scan-org1", Some(json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = app
        .send(Method::PATCH, "/schedulers/scan-org1", Some(json!({"enabled": false})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    // 停用后推入被拒绝
    let (status, _, _) = app
        .send(
            Method::POST,
            "/queues/scan-org1/push",
            Some(json!({"priority": 1, "data": scan_payload("a")})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn test_push_pop_and_report_status() {
    let app = TestApp::spawn().await;

    for (target, priority) in [("b", 2), ("a", 1)] {
        let (status, _, body) = app
            .send(
                Method::POST,
                "/queues/scan-org1/push",
                Some(json!({"priority": priority, "data": scan_payload(target)})),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["data"]["status"], "queued");
    }

    let (_, _, body) = app.send(Method::GET, "/queues/scan-org1", None).await;
    assert_eq!(body["data"]["size"], 2);

    let (status, _, body) = app
        .send(Method::POST, "/queues/scan-org1/pop?limit=5", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    let popped = body["data"].as_array().unwrap();
    assert_eq!(popped.len(), 2);
    assert_eq!(popped[0]["priority"], 1);
    assert_eq!(popped[0]["status"], "dispatched");

    // 空队列返回空列表
    let (status, _, body) = app
        .send(Method::POST, "/queues/scan-org1/pop", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"], json!([]));

    let task_id = popped[0]["id"].as_str().unwrap().to_string();
    let uri = format!("/tasks/{task_id}");
    let (status, _, body) = app
        .send(Method::PATCH, &uri, Some(json!({"status": "completed"})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    assert!(body["data"]["dispatched"].is_number());

    let (status, _, _) = app
        .send(Method::PATCH, &uri, Some(json!({"status": "running"})))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _, body) = app
        .send(Method::GET, "/tasks/stats?scheduler_id=scan-org1", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["completed"], 1);
    assert_eq!(body["data"]["dispatched"], 1);
}

#[tokio::test]
async fn test_push_rejects_invalid_items() {
    let app = TestApp::spawn().await;

    let (status, _, body) = app
        .send(
            Method::POST,
            "/queues/scan-org1/push",
            Some(json!({"priority": 1, "data": {"foo": "bar"}})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "INVALID_ITEM");

    let (status, _, _) = app
        .send(
            Method::POST,
            "/queues/scan-org1/push",
            Some(json!({"priority": 1, "data": scan_payload("a"), "hash": "wrong"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, _) = app
        .send(
            Method::POST,
            "/queues/nope/push",
            Some(json!({"priority": 1, "data": scan_payload("a")})),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_full_queue_returns_429() {
    let mut config = TestEnv::scheduler_config();
    config.pq_maxsize = 1;
    let app = TestApp::spawn_with(config).await;

    let (status, _, _) = app
        .send(
            Method::POST,
            "/queues/scan-org1/push",
            Some(json!({"priority": 5, "data": scan_payload("a")})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, headers, _) = app
        .send(
            Method::POST,
            "/queues/scan-org1/push",
            Some(json!({"priority": 5, "data": scan_payload("b")})),
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(headers[header::RETRY_AFTER], "60");
}

#[tokio::test]
async fn test_task_search_rejects_unknown_column() {
    let app = TestApp::spawn().await;

    let (status, _, body) = app
        .send(
            Method::POST,
            "/tasks/search",
            Some(json!({"filters": [{"column": "nope", "operator": "eq", "value": 1}]})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["type"], "INVALID_FILTER");

    let (status, _, _) = app.send(Method::GET, "/tasks?status=bogus", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = app.send(Method::GET, "/tasks?limit=10", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 0);
    assert_eq!(body["data"]["limit"], 10);
}

#[tokio::test]
async fn test_schedule_lifecycle() {
    let app = TestApp::spawn().await;
    let data = json!({"report_recipe_id": "weekly", "organisation": "org1"});
    let expected_hash = ReportTask {
        id: uuid::Uuid::new_v4(),
        report_recipe_id: "weekly".to_string(),
        organisation: "org1".to_string(),
    }
    .hash();

    let (status, _, _) = app
        .send(
            Method::POST,
            "/schedules",
            Some(json!({"scheduler_id": "report-org1", "data": data, "schedule": "not a cron"})),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = app
        .send(
            Method::POST,
            "/schedules",
            Some(json!({"scheduler_id": "report-org1", "data": data, "schedule": "0 6 * * 1"})),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["hash"], expected_hash);
    assert_eq!(body["data"]["organisation"], "org1");
    assert!(body["data"]["deadline_at"].is_string());
    let id = body["data"]["id"].as_str().unwrap().to_string();

    let (status, _, _) = app
        .send(
            Method::POST,
            "/schedules",
            Some(json!({"scheduler_id": "report-org1", "data": data})),
        )
        .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let uri = format!("/schedules/{id}");
    let (status, _, _) = app.send(Method::PATCH, &uri, Some(json!({}))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _, body) = app
        .send(Method::PATCH, &uri, Some(json!({"enabled": false})))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["enabled"], false);

    let (status, _, body) = app
        .send(Method::GET, "/schedules?scheduler_id=report-org1&enabled=false", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["total"], 1);

    let (status, _, _) = app.send(Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _, _) = app.send(Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_publish_events() {
    let app = TestApp::spawn().await;
    let object = ScanObjectBuilder::hostname("a.example").level(2).build();

    let mutation = MutationBuilder::new("org1", object.clone()).build();
    let (status, _, _) = app
        .send(
            Method::POST,
            "/events/scan-levels",
            Some(serde_json::to_value(&mutation).unwrap()),
        )
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(app.events.pending(EventTopic::ScanLevels, "org1").await, 1);

    let unknown = MutationBuilder::new("org9", object).build();
    let (status, _, _) = app
        .send(
            Method::POST,
            "/events/scan-levels",
            Some(serde_json::to_value(&unknown).unwrap()),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
