//! 后处理任务调度器
//!
//! 每条新的原始数据按内容类型标签匹配后处理插件，每个插件对每条数据只处理一次。

use std::collections::HashSet;
use std::sync::Arc;

use scheduler_core::SchedulerResult;
use scheduler_domain::{
    Plugin, PostProcessTask, PrioritizedItem, RawArtifactReceived, Task, TaskPayload, TaskType,
};
use scheduler_infrastructure::{EventTopic, SchedulerEvent, StructuredLogger};
use tracing::{debug, instrument, warn};

use crate::queue::{PriorityQueue, QueueOptions};
use crate::ranker::{DeadlineRanker, RankInput, Ranker};
use crate::scheduler::{PushOptions, Scheduler, SchedulerContext};

pub struct PostProcessScheduler {
    base: Scheduler,
}

impl PostProcessScheduler {
    pub fn scheduler_id_for(organisation: &str) -> String {
        format!("post-process-{organisation}")
    }

    pub fn new(ctx: SchedulerContext, organisation: &str) -> Self {
        let scheduler_id = Self::scheduler_id_for(organisation);
        let queue = PriorityQueue::new(
            scheduler_id.clone(),
            TaskType::PostProcess,
            ctx.queue_store.clone(),
            QueueOptions {
                maxsize: ctx.config.pq_maxsize,
                allow_priority_updates: true,
                ..QueueOptions::default()
            },
        );

        Self {
            base: Scheduler::new(scheduler_id, organisation, queue, ctx),
        }
    }

    pub fn base(&self) -> &Scheduler {
        &self.base
    }

    pub async fn run(self: &Arc<Self>) {
        let ctx = self.base.context();
        let receiver = ctx
            .events
            .subscribe(EventTopic::RawArtifacts, self.base.organisation())
            .await;

        let this = Arc::clone(self);
        self.base
            .spawn_listener("raw-artifacts", receiver, move |event| {
                let this = Arc::clone(&this);
                async move {
                    match event {
                        SchedulerEvent::RawArtifact(received) => {
                            this.handle_artifact(received).await
                        }
                        other => {
                            debug!("后处理调度器忽略 {} 事件", other.topic());
                            Ok(())
                        }
                    }
                }
            })
            .await;

        StructuredLogger::log_scheduler_enabled(self.base.id(), self.base.loop_count().await);
    }

    pub async fn enable(self: &Arc<Self>) {
        if self.base.mark_enabled().await {
            self.run().await;
        }
    }

    #[instrument(skip(self, received), fields(scheduler_id = %self.base.id(), artifact_id = %received.artifact.id))]
    pub async fn handle_artifact(&self, received: RawArtifactReceived) -> SchedulerResult<()> {
        if received.artifact.is_error() {
            debug!("原始数据 {} 是错误结果，跳过", received.artifact.id);
            return Ok(());
        }

        let plugins = self.plugins_for_artifact(&received).await?;
        debug!(
            "原始数据 {} 匹配到 {} 个后处理插件",
            received.artifact.id,
            plugins.len()
        );

        let received = &received;
        self.base
            .evaluate_concurrently("raw_artifacts", plugins, |plugin| async move {
                self.push_task(&plugin, received).await?;
                Ok(())
            })
            .await
    }

    /// 按标签收集插件，同一插件只保留一次
    async fn plugins_for_artifact(
        &self,
        received: &RawArtifactReceived,
    ) -> SchedulerResult<Vec<Plugin>> {
        let catalog = &self.base.context().catalog;
        let mut seen = HashSet::new();
        let mut plugins = Vec::new();

        for tag in &received.artifact.content_type_tags {
            let matched = match catalog
                .get_post_process_plugins_by_tag(tag, self.base.organisation())
                .await
            {
                Ok(matched) => matched,
                Err(e) => {
                    warn!("获取标签 {} 的后处理插件失败: {}", tag, e);
                    continue;
                }
            };

            for plugin in matched {
                if seen.insert(plugin.id.clone()) {
                    plugins.push(plugin);
                }
            }
        }

        Ok(plugins)
    }

    pub async fn push_task(
        &self,
        plugin: &Plugin,
        received: &RawArtifactReceived,
    ) -> SchedulerResult<Option<Task>> {
        let task = PostProcessTask::new(plugin, received.artifact.clone(), self.base.organisation());
        let hash = task.hash();

        if !plugin.enabled {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "插件已停用");
            return Ok(None);
        }

        let ctx = self.base.context();
        if let Some(latest) = ctx.task_repo.get_latest_by_hash(&hash).await? {
            if !latest.is_terminal() {
                StructuredLogger::log_task_skipped(self.base.id(), &hash, "任务仍在运行");
                return Ok(None);
            }
        }

        if self.base.is_item_on_queue_by_hash(&hash).await? {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "任务已在队列中");
            return Ok(None);
        }

        let priority = DeadlineRanker.rank(&RankInput::at(received.occurred_at));
        let item = PrioritizedItem::from_payload(self.base.id(), priority, &task)?;

        match self
            .base
            .push_item_to_queue_with_timeout(
                item,
                PushOptions::default(),
                ctx.config.push_max_tries,
                ctx.push_poll_interval(),
            )
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(e) if e.is_push_rejection() => {
                self.base.record_rejection(&hash, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
