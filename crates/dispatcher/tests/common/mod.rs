#![allow(dead_code)]

use std::sync::Arc;

use chrono::{DateTime, Utc};
use scheduler_core::SchedulerConfig;
use scheduler_dispatcher::SchedulerContext;
use scheduler_domain::{Schedule, Task, TaskPayload};
use scheduler_infrastructure::{EventBus, MetricsCollector};
use scheduler_testing_utils::database::TestStores;
use scheduler_testing_utils::{
    MockArtifactService, MockCatalogService, MockObjectService, TestEnv,
};

pub struct Harness {
    pub ctx: SchedulerContext,
    pub catalog: MockCatalogService,
    pub objects: MockObjectService,
    pub artifacts: MockArtifactService,
    pub stores: TestStores,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(TestEnv::scheduler_config()).await
    }

    pub async fn with_config(config: SchedulerConfig) -> Self {
        let stores = TestStores::new().await;
        let catalog = MockCatalogService::with_organisations(&["org1"]);
        let objects = MockObjectService::new();
        let artifacts = MockArtifactService::new();

        let ctx = SchedulerContext {
            config,
            task_repo: stores.tasks.clone(),
            schedule_repo: stores.schedules.clone(),
            queue_store: stores.queue.clone(),
            catalog: Arc::new(catalog.clone()),
            objects: Arc::new(objects.clone()),
            artifacts: Arc::new(artifacts.clone()),
            events: Arc::new(EventBus::default()),
            metrics: MetricsCollector::disabled(),
        };

        Self {
            ctx,
            catalog,
            objects,
            artifacts,
            stores,
        }
    }

    pub async fn tasks_by_hash(&self, hash: &str) -> Vec<Task> {
        self.stores.tasks.get_by_hash(hash, 100).await.unwrap()
    }

    /// 写入一条截止时间已过的调度记录
    pub async fn expired_schedule<P: TaskPayload>(
        &self,
        scheduler_id: &str,
        payload: &P,
        deadline_at: DateTime<Utc>,
    ) -> Schedule {
        let mut schedule = Schedule::new(
            scheduler_id,
            payload.organisation(),
            payload.hash(),
            serde_json::to_value(payload).unwrap(),
        );
        schedule.deadline_at = Some(deadline_at);
        self.stores.schedules.create(&schedule).await.unwrap()
    }
}
