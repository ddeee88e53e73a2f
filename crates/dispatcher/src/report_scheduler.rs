//! 报告任务调度器：到期的报告调度记录各生成一个报告任务

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{PrioritizedItem, ReportTask, Schedule, Task, TaskPayload, TaskType};
use scheduler_infrastructure::StructuredLogger;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::queue::{PriorityQueue, QueueOptions};
use crate::ranker::{DeadlineRanker, RankInput, Ranker};
use crate::scheduler::{PushOptions, Recurrence, Scheduler, SchedulerContext};

pub struct ReportScheduler {
    base: Scheduler,
}

impl ReportScheduler {
    pub fn scheduler_id_for(organisation: &str) -> String {
        format!("report-{organisation}")
    }

    pub fn new(ctx: SchedulerContext, organisation: &str) -> Self {
        let scheduler_id = Self::scheduler_id_for(organisation);
        let queue = PriorityQueue::new(
            scheduler_id.clone(),
            TaskType::Report,
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
        let interval =
            StdDuration::from_secs(self.base.context().config.reschedule_interval_seconds);

        let this = Arc::clone(self);
        self.base
            .spawn_periodic("rescheduling", interval, move || {
                let this = Arc::clone(&this);
                async move { this.process_rescheduling().await }
            })
            .await;

        StructuredLogger::log_scheduler_enabled(self.base.id(), self.base.loop_count().await);
    }

    pub async fn enable(self: &Arc<Self>) {
        if self.base.mark_enabled().await {
            self.run().await;
        }
    }

    #[instrument(skip(self), fields(scheduler_id = %self.base.id()))]
    pub async fn process_rescheduling(&self) -> SchedulerResult<()> {
        let schedules = self
            .base
            .context()
            .schedule_repo
            .get_expired(self.base.id(), Utc::now())
            .await?;

        if schedules.is_empty() {
            return Ok(());
        }
        debug!("报告调度器 {} 有 {} 条到期调度记录", self.base.id(), schedules.len());

        self.base
            .evaluate_concurrently("rescheduling", schedules, |schedule| async move {
                self.push_from_schedule(schedule).await?;
                Ok(())
            })
            .await
    }

    pub async fn push_from_schedule(&self, mut schedule: Schedule) -> SchedulerResult<Option<Task>> {
        let mut task: ReportTask = match serde_json::from_value(schedule.data.clone()) {
            Ok(task) => task,
            Err(e) => {
                schedule.enabled = false;
                schedule.modified_at = Utc::now();
                self.base.context().schedule_repo.update(&schedule).await?;
                StructuredLogger::log_schedule_disabled(
                    self.base.id(),
                    schedule.id,
                    &format!("报告负载无法解析: {e}"),
                );
                return Ok(None);
            }
        };
        task.id = Uuid::new_v4();
        let hash = task.hash();

        if self.base.is_item_on_queue_by_hash(&hash).await? {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "任务已在队列中");
            return Ok(None);
        }

        let priority = DeadlineRanker.rank(&RankInput::at(Utc::now()));
        let item = PrioritizedItem::from_payload(self.base.id(), priority, &task)?;
        let options = PushOptions {
            deduplication_key: None,
            recurrence: Some(Recurrence {
                cron: schedule.schedule.clone(),
                interval: schedule.interval_seconds.map(Duration::seconds),
            }),
        };

        let ctx = self.base.context();
        match self
            .base
            .push_item_to_queue_with_timeout(
                item,
                options,
                ctx.config.push_max_tries,
                ctx.push_poll_interval(),
            )
            .await
        {
            Ok(task) => Ok(Some(task)),
            Err(SchedulerError::QueueFull { queue_id }) => {
                warn!("队列 {} 已满，跳过报告调度记录 {}", queue_id, schedule.id);
                Ok(None)
            }
            Err(e) if e.is_push_rejection() => {
                self.base.record_rejection(&hash, &e);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
