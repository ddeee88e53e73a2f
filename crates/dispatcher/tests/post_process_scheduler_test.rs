mod common;

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};
    use scheduler_dispatcher::PostProcessScheduler;
    use scheduler_domain::{PostProcessTask, TaskPayload, TaskStatus};
    use scheduler_testing_utils::{ArtifactEventBuilder, PluginBuilder};

    use super::common::Harness;

    fn setup(harness: &Harness) -> PostProcessScheduler {
        harness.catalog.add_plugin(
            "org1",
            PluginBuilder::post_process("kat_dns")
                .consumes(&["boefje/dns-records", "text/plain"])
                .build(),
        );
        harness.catalog.add_plugin(
            "org1",
            PluginBuilder::post_process("kat_disabled")
                .consumes(&["text/plain"])
                .enabled(false)
                .build(),
        );
        PostProcessScheduler::new(harness.ctx.clone(), "org1")
    }

    #[tokio::test]
    async fn test_artifact_creates_one_task_per_plugin() {
        let harness = Harness::new().await;
        let scheduler = setup(&harness);
        let occurred_at = Utc::now() - Duration::minutes(3);

        let event = ArtifactEventBuilder::new("org1", "raw-1")
            .tags(&["boefje/dns-records", "text/plain"])
            .occurred_at(occurred_at)
            .build();
        scheduler.handle_artifact(event.clone()).await.unwrap();

        let queued = scheduler.base().queue().list().await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].priority, Some(occurred_at.timestamp()));

        let plugin = PluginBuilder::post_process("kat_dns").build();
        let hash = PostProcessTask::new(&plugin, event.artifact.clone(), "org1").hash();
        let tasks = harness.tasks_by_hash(&hash).await;
        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].status, TaskStatus::Queued);
        assert_eq!(tasks[0].data["artifact"]["id"], "raw-1");
    }

    #[tokio::test]
    async fn test_error_artifacts_are_skipped() {
        let harness = Harness::new().await;
        let scheduler = setup(&harness);

        let event = ArtifactEventBuilder::new("org1", "raw-err")
            .tags(&["text/plain", "error/timeout"])
            .build();
        scheduler.handle_artifact(event).await.unwrap();

        assert!(scheduler.base().queue().is_empty().await.unwrap());
        assert_eq!(harness.catalog.call_count("get_plugins"), 0);
    }

    #[tokio::test]
    async fn test_same_artifact_is_processed_once() {
        let harness = Harness::new().await;
        let scheduler = setup(&harness);

        let event = ArtifactEventBuilder::new("org1", "raw-2")
            .tags(&["text/plain"])
            .build();
        scheduler.handle_artifact(event.clone()).await.unwrap();
        scheduler.handle_artifact(event).await.unwrap();

        assert_eq!(scheduler.base().queue().qsize().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_artifacts_pop_in_arrival_order() {
        let harness = Harness::new().await;
        let scheduler = setup(&harness);
        let now = Utc::now();

        for (id, age) in [("late", 1), ("early", 10)] {
            let event = ArtifactEventBuilder::new("org1", id)
                .tags(&["text/plain"])
                .occurred_at(now - Duration::minutes(age))
                .build();
            scheduler.handle_artifact(event).await.unwrap();
        }

        let popped = scheduler.base().pop_item_from_queue(None, 2).await.unwrap();
        assert_eq!(popped[0].data["artifact"]["id"], "early");
        assert_eq!(popped[1].data["artifact"]["id"], "late");
    }
}
