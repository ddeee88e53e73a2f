use std::sync::Arc;
use std::time::Duration;

use scan_scheduler::{AppMode, Application, ExternalServices, ShutdownManager};
use scheduler_core::AppConfig;
use scheduler_infrastructure::{DatabaseManager, EventTopic, MetricsCollector, SchedulerEvent};
use scheduler_testing_utils::{
    MockArtifactService, MockCatalogService, MockObjectService, MutationBuilder,
    ScanObjectBuilder, TestEnv,
};

async fn build_app(catalog: &MockCatalogService, mode: AppMode) -> Application {
    build_app_with_db(catalog, mode).await.0
}

async fn build_app_with_db(
    catalog: &MockCatalogService,
    mode: AppMode,
) -> (Application, DatabaseManager) {
    let mut config = AppConfig::default();
    config.scheduler = TestEnv::scheduler_config();
    config.scheduler.monitor_organisations_interval_seconds = 1;
    // 关闭缓存，使租户变化立即可见
    config.services.cache_ttl_seconds = 0;

    let database = DatabaseManager::in_memory().await.unwrap();
    let services = ExternalServices {
        catalog: Arc::new(catalog.clone()),
        objects: Arc::new(MockObjectService::new()),
        artifacts: Arc::new(MockArtifactService::new()),
    };

    let app = Application::with_parts(
        config,
        mode,
        database.clone(),
        services,
        MetricsCollector::disabled(),
    )
    .await
    .unwrap();
    (app, database)
}

#[tokio::test]
async fn test_sync_registers_schedulers_per_organisation() {
    let catalog = MockCatalogService::with_organisations(&["org1", "org2"]);
    let app = build_app(&catalog, AppMode::Api).await;

    app.sync_organisations().await.unwrap();

    assert_eq!(app.registry().len().await, 6);
    let ids: Vec<String> = app
        .registry()
        .list_by_organisation("org1")
        .await
        .iter()
        .map(|s| s.id().to_string())
        .collect();
    assert_eq!(ids, vec!["post-process-org1", "report-org1", "scan-org1"]);
}

#[tokio::test]
async fn test_sync_removes_vanished_organisation() {
    let catalog = MockCatalogService::with_organisations(&["org1", "org2"]);
    let app = build_app(&catalog, AppMode::Api).await;
    app.sync_organisations().await.unwrap();

    catalog.remove_organisation("org2");
    app.sync_organisations().await.unwrap();

    assert_eq!(app.registry().len().await, 3);
    assert!(app.registry().get("scan-org2").await.is_none());
    assert!(app.registry().get("scan-org1").await.is_some());
}

#[tokio::test]
async fn test_removal_disables_every_scheduler_despite_storage_failure() {
    let catalog = MockCatalogService::with_organisations(&["org1", "org2"]);
    let (app, database) = build_app_with_db(&catalog, AppMode::Api).await;
    app.sync_organisations().await.unwrap();

    let org2 = app.registry().list_by_organisation("org2").await;
    assert_eq!(org2.len(), 3);
    let mutation = MutationBuilder::new("org2", ScanObjectBuilder::hostname("a.example").build())
        .build();
    app.context()
        .events
        .publish(SchedulerEvent::ScanLevel(mutation))
        .await
        .unwrap();
    assert_eq!(app.context().events.pending(EventTopic::ScanLevels, "org2").await, 1);

    // 存储不可用时停用会失败
    database.close().await;
    catalog.remove_organisation("org2");
    assert!(app.sync_organisations().await.is_err());

    assert!(org2.iter().all(|scheduler| !scheduler.is_enabled()));
    assert_eq!(app.registry().len().await, 3);
    assert_eq!(app.context().events.pending(EventTopic::ScanLevels, "org2").await, 0);
}

#[tokio::test]
async fn test_sync_is_noop_without_changes() {
    let catalog = MockCatalogService::with_organisations(&["org1"]);
    let app = build_app(&catalog, AppMode::Api).await;

    app.sync_organisations().await.unwrap();
    app.sync_organisations().await.unwrap();

    assert_eq!(app.registry().len().await, 3);
}

#[tokio::test]
async fn test_sync_propagates_catalog_failure() {
    let catalog = MockCatalogService::with_organisations(&["org1"]);
    let app = build_app(&catalog, AppMode::Api).await;

    catalog.set_failing(true);
    assert!(app.sync_organisations().await.is_err());
    assert!(app.registry().is_empty().await);
}

#[tokio::test]
async fn test_collect_metrics_with_disabled_collector() {
    let catalog = MockCatalogService::with_organisations(&["org1"]);
    let app = build_app(&catalog, AppMode::Api).await;
    app.sync_organisations().await.unwrap();

    assert!(app.collect_metrics().await.is_ok());
}

#[tokio::test]
async fn test_scheduler_mode_picks_up_new_organisation_and_shuts_down() {
    let catalog = MockCatalogService::with_organisations(&["org1"]);
    let app = Arc::new(build_app(&catalog, AppMode::Scheduler).await);
    let shutdown = ShutdownManager::new();

    let handle = {
        let app = Arc::clone(&app);
        let rx = shutdown.subscribe().await;
        tokio::spawn(async move { app.run(rx).await })
    };

    let registry = Arc::clone(app.registry());
    assert!(
        TestEnv::wait_for(
            || {
                let registry = Arc::clone(&registry);
                async move { registry.len().await == 3 }
            },
            Duration::from_secs(3),
        )
        .await
    );

    catalog.add_organisation("org2");
    assert!(
        TestEnv::wait_for(
            || {
                let registry = Arc::clone(&registry);
                async move { registry.get("scan-org2").await.is_some() }
            },
            Duration::from_secs(5),
        )
        .await
    );

    shutdown.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
}
