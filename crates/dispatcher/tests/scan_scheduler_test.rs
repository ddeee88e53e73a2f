mod common;

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Weak};

    use chrono::{Duration, Utc};
    use scheduler_dispatcher::{ScanScheduler, SchedulerKind, SchedulerRegistry};
    use scheduler_domain::{
        LastRun, MutationOperation, PrioritizedItem, ScanTask, TaskPayload, TaskStatus,
    };
    use scheduler_testing_utils::{MutationBuilder, PluginBuilder, ScanObjectBuilder};

    use super::common::Harness;

    const HOST: &str = "Hostname|internet|example.com";

    fn setup_plugin(harness: &Harness, level: i32) -> scheduler_domain::Plugin {
        let plugin = PluginBuilder::scan("dns-records")
            .consumes(&["Hostname"])
            .scan_level(Some(level))
            .build();
        harness.catalog.add_plugin("org1", plugin.clone());
        plugin
    }

    fn hash_for(plugin: &scheduler_domain::Plugin, target: &str, org: &str) -> String {
        ScanTask::new(plugin, Some(target.to_string()), org).hash()
    }

    /// 插件要求强度 2，对象强度 1：不产生任务
    #[tokio::test]
    async fn test_insufficient_scan_level_yields_no_task() {
        let harness = Harness::new().await;
        setup_plugin(&harness, 2);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        scheduler
            .handle_mutation(MutationBuilder::new("org1", object).build())
            .await
            .unwrap();

        assert!(scheduler.base().queue().is_empty().await.unwrap());
        let (tasks, total) = harness
            .stores
            .tasks
            .list(&Default::default())
            .await
            .unwrap();
        assert!(tasks.is_empty());
        assert_eq!(total, 0);
    }

    #[tokio::test]
    async fn test_mutation_enqueues_eligible_pair() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        let object = ScanObjectBuilder::hostname("example.com").level(2).build();
        scheduler
            .handle_mutation(MutationBuilder::new("org1", object).build())
            .await
            .unwrap();

        let hash = hash_for(&plugin, HOST, "org1");
        let tasks = harness.tasks_by_hash(&hash).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Queued);
        assert_eq!(tasks[0].data["input_object"], HOST);
        assert!(scheduler.base().is_item_on_queue_by_hash(&hash).await.unwrap());

        let schedule = harness.stores.schedules.get_by_hash(&hash).await.unwrap().unwrap();
        assert!(schedule.deadline_at.is_some());
    }

    #[tokio::test]
    async fn test_mutation_without_value_is_skipped() {
        let harness = Harness::new().await;
        setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        let object = ScanObjectBuilder::hostname("example.com").level(2).build();
        scheduler
            .handle_mutation(MutationBuilder::new("org1", object).without_value().build())
            .await
            .unwrap();

        assert!(scheduler.base().queue().is_empty().await.unwrap());
        assert_eq!(harness.catalog.call_count("get_plugins"), 0);
    }

    #[tokio::test]
    async fn test_delete_mutation_cancels_queued_tasks() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        let object = ScanObjectBuilder::hostname("example.com").level(2).build();
        scheduler
            .handle_mutation(MutationBuilder::new("org1", object.clone()).build())
            .await
            .unwrap();
        assert_eq!(scheduler.base().queue().qsize().await.unwrap(), 1);

        scheduler
            .handle_mutation(
                MutationBuilder::new("org1", object)
                    .operation(MutationOperation::Delete)
                    .build(),
            )
            .await
            .unwrap();

        assert!(scheduler.base().queue().is_empty().await.unwrap());
        let tasks = harness.tasks_by_hash(&hash_for(&plugin, HOST, "org1")).await;
        assert_eq!(tasks[0].status, TaskStatus::Cancelled);
    }

    /// 连续两次评估同一候选最多产生一个任务
    #[tokio::test]
    async fn test_repeated_evaluation_creates_one_task() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());
        let object = ScanObjectBuilder::hostname("example.com").level(1).build();

        let first = scheduler
            .evaluate_candidate(&plugin, Some(object.clone()))
            .await
            .unwrap();
        let second = scheduler
            .evaluate_candidate(&plugin, Some(object))
            .await
            .unwrap();

        assert!(first.is_some());
        assert!(second.is_none());
        assert_eq!(harness.tasks_by_hash(&first.unwrap().hash).await.len(), 1);
    }

    #[tokio::test]
    async fn test_recent_artifact_run_blocks_new_task() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        harness.artifacts.set_last_run(
            "dns-records",
            Some(HOST),
            "org1",
            LastRun {
                started_at: Some(Utc::now() - Duration::minutes(10)),
                ended_at: Some(Utc::now() - Duration::minutes(5)),
            },
        );

        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        let pushed = scheduler.evaluate_candidate(&plugin, Some(object)).await.unwrap();
        assert!(pushed.is_none());
    }

    #[tokio::test]
    async fn test_running_artifact_blocks_new_task() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        harness.artifacts.set_last_run(
            "dns-records",
            Some(HOST),
            "org1",
            LastRun {
                started_at: Some(Utc::now() - Duration::days(3)),
                ended_at: None,
            },
        );

        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        assert!(scheduler
            .evaluate_candidate(&plugin, Some(object))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_artifact_store_failure_skips_candidate() {
        let harness = Harness::new().await;
        setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());
        harness.artifacts.set_failing(true);

        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        // 单个候选失败不影响整批处理
        scheduler
            .handle_mutation(MutationBuilder::new("org1", object).build())
            .await
            .unwrap();
        assert!(scheduler.base().queue().is_empty().await.unwrap());
    }

    /// 已分发但长时间无进展的任务被标记为失败，随后可重新入队
    #[tokio::test]
    async fn test_stale_dispatched_task_is_failed_and_requeued() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        let payload = ScanTask::new(&plugin, Some(HOST.to_string()), "org1");
        let item = PrioritizedItem::from_payload("scan-org1", 2, &payload).unwrap();
        let mut stale = scheduler_domain::Task::from_item(&item, "org1", scheduler_domain::TaskType::Scan);
        let long_ago = Utc::now() - Duration::days(3);
        stale.status = TaskStatus::Dispatched;
        stale.created_at = long_ago;
        stale.modified_at = long_ago;
        harness.stores.tasks.create(&stale).await.unwrap();

        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        let pushed = scheduler
            .evaluate_candidate(&plugin, Some(object))
            .await
            .unwrap()
            .expect("new task after stale one");

        let failed = harness.stores.tasks.get_by_id(stale.id).await.unwrap().unwrap();
        assert_eq!(failed.status, TaskStatus::Failed);
        assert_ne!(pushed.id, stale.id);
        assert_eq!(pushed.status, TaskStatus::Queued);
        assert_eq!(pushed.hash, payload.hash());
    }

    #[tokio::test]
    async fn test_non_terminal_task_blocks_duplicate() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());
        let object = ScanObjectBuilder::hostname("example.com").level(1).build();

        let first = scheduler
            .evaluate_candidate(&plugin, Some(object.clone()))
            .await
            .unwrap()
            .unwrap();
        let mut running = scheduler.base().pop_item_from_queue(None, 1).await.unwrap().remove(0);
        running.update_status(TaskStatus::Running);
        // 运行中且已超过宽限期
        running.modified_at = Utc::now() - Duration::days(3);
        harness.stores.tasks.update(&running).await.unwrap();

        assert!(scheduler
            .evaluate_candidate(&plugin, Some(object))
            .await
            .unwrap()
            .is_none());

        let active: Vec<_> = harness
            .tasks_by_hash(&first.hash)
            .await
            .into_iter()
            .filter(|t| !t.is_terminal())
            .collect();
        assert_eq!(active.len(), 1);
    }

    #[tokio::test]
    async fn test_plugin_interval_overrides_grace_period() {
        let harness = Harness::new().await;
        let plugin = PluginBuilder::scan("dns-records")
            .consumes(&["Hostname"])
            .interval_minutes(1)
            .build();
        harness.catalog.add_plugin("org1", plugin.clone());
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        harness.artifacts.set_last_run(
            "dns-records",
            Some(HOST),
            "org1",
            LastRun {
                started_at: Some(Utc::now() - Duration::minutes(10)),
                ended_at: Some(Utc::now() - Duration::minutes(5)),
            },
        );

        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        assert!(scheduler
            .evaluate_candidate(&plugin, Some(object))
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_new_plugins_scan_matching_objects() {
        let harness = Harness::new().await;
        let plugin = PluginBuilder::scan("nmap")
            .consumes(&["Hostname"])
            .scan_level(Some(2))
            .build();
        harness.catalog.add_plugin("org1", plugin.clone());
        harness.catalog.set_new_plugins("org1", vec![plugin.clone()]);
        harness
            .objects
            .add_object("org1", ScanObjectBuilder::hostname("a.example").level(3).build());
        harness
            .objects
            .add_object("org1", ScanObjectBuilder::hostname("b.example").level(1).build());

        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());
        scheduler.process_new_plugins().await.unwrap();

        let queued = scheduler.base().queue().list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].data["input_object"], "Hostname|internet|a.example");
    }

    #[tokio::test]
    async fn test_rescheduling_requeues_valid_schedule() {
        let harness = Harness::new().await;
        let plugin = setup_plugin(&harness, 1);
        harness
            .objects
            .add_object("org1", ScanObjectBuilder::hostname("example.com").level(2).build());
        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());

        let payload = ScanTask::new(&plugin, Some(HOST.to_string()), "org1");
        let expired = harness
            .expired_schedule("scan-org1", &payload, Utc::now() - Duration::minutes(1))
            .await;

        scheduler.process_rescheduling().await.unwrap();

        assert!(scheduler
            .base()
            .is_item_on_queue_by_hash(&payload.hash())
            .await
            .unwrap());
        let schedule = harness.stores.schedules.get_by_id(expired.id).await.unwrap().unwrap();
        assert!(schedule.enabled);
        assert!(schedule.deadline_at.unwrap() > Utc::now());
    }

    #[tokio::test]
    async fn test_rescheduling_disables_invalid_schedules() {
        let harness = Harness::new().await;
        let disabled_plugin = PluginBuilder::scan("disabled-plugin")
            .consumes(&["Hostname"])
            .enabled(false)
            .build();
        harness.catalog.add_plugin("org1", disabled_plugin.clone());
        let missing_plugin = PluginBuilder::scan("missing-plugin").consumes(&["Hostname"]).build();
        let low_level = setup_plugin(&harness, 3);
        harness
            .objects
            .add_object("org1", ScanObjectBuilder::hostname("example.com").level(1).build());

        let scheduler = ScanScheduler::new(harness.ctx.clone(), "org1", Weak::new());
        let past = Utc::now() - Duration::minutes(1);
        let mut schedule_ids = Vec::new();
        for plugin in [&disabled_plugin, &missing_plugin, &low_level] {
            let payload = ScanTask::new(plugin, Some(HOST.to_string()), "org1");
            schedule_ids.push(harness.expired_schedule("scan-org1", &payload, past).await.id);
        }
        let gone_object = ScanTask::new(&low_level, Some("Hostname|internet|gone".into()), "org1");
        schedule_ids.push(harness.expired_schedule("scan-org1", &gone_object, past).await.id);

        scheduler.process_rescheduling().await.unwrap();

        for id in schedule_ids {
            let schedule = harness.stores.schedules.get_by_id(id).await.unwrap().unwrap();
            assert!(!schedule.enabled, "schedule {id} should be disabled");
        }
        assert!(scheduler.base().queue().is_empty().await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_organisations_receive_linked_tasks() {
        let harness = Harness::new().await;
        harness.catalog.add_organisation("org2");
        let plugin = setup_plugin(&harness, 1);
        harness.catalog.add_plugin("org2", plugin.clone());
        harness.catalog.set_duplicate_organisations("dns-records", "org1", &["org2"]);
        harness
            .objects
            .add_object("org2", ScanObjectBuilder::hostname("example.com").level(1).build());

        let registry = Arc::new(SchedulerRegistry::new());
        registry.add_organisation(&harness.ctx, "org1").await;
        registry.add_organisation(&harness.ctx, "org2").await;

        let org1 = registry.scan_scheduler("org1").await.unwrap();
        let object = ScanObjectBuilder::hostname("example.com").level(1).build();
        let origin = org1
            .evaluate_candidate(&plugin, Some(object))
            .await
            .unwrap()
            .unwrap();
        assert!(origin.deduplication_key.is_none());

        let sibling_hash = hash_for(&plugin, HOST, "org2");
        let siblings = harness.tasks_by_hash(&sibling_hash).await;
        assert_eq!(siblings.len(), 1);
        assert_eq!(siblings[0].scheduler_id, "scan-org2");
        assert_eq!(siblings[0].deduplication_key, Some(origin.id));

        match registry.get("scan-org2").await.unwrap() {
            SchedulerKind::Scan(s) => assert_eq!(s.base().queue().qsize().await.unwrap(), 1),
            other => panic!("unexpected scheduler kind: {other:?}"),
        }
    }
}
