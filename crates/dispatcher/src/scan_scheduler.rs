//! 扫描任务调度器
//!
//! 三个来源产生扫描任务：对象扫描强度变更事件、新启用的插件、到期的调度记录。
//! 每个候选 (插件, 对象) 在入队前依次通过权限、宽限期、卡死检测、
//! 运行中与已排队检查。

use std::sync::{Arc, Weak};
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    MutationOperation, Plugin, PluginType, PrioritizedItem, ScanLevelMutation, ScanObject,
    ScanTask, Schedule, Task, TaskPayload, TaskStatus, TaskType,
};
use scheduler_infrastructure::{EventTopic, SchedulerEvent, StructuredLogger};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::queue::{PriorityQueue, QueueOptions};
use crate::ranker::{HistoryRanker, RankInput, Ranker};
use crate::registry::SchedulerRegistry;
use crate::scheduler::{PushOptions, Recurrence, Scheduler, SchedulerContext};

const MAX_SCAN_LEVEL: i32 = 4;
/// 排序时参考的历史任务条数
const RANK_HISTORY_LIMIT: i64 = 10;

pub struct ScanScheduler {
    base: Scheduler,
    registry: Weak<SchedulerRegistry>,
}

impl ScanScheduler {
    pub fn scheduler_id_for(organisation: &str) -> String {
        format!("scan-{organisation}")
    }

    /// `registry` 用于跨租户派生任务；测试中可传 `Weak::new()`
    pub fn new(
        ctx: SchedulerContext,
        organisation: &str,
        registry: Weak<SchedulerRegistry>,
    ) -> Self {
        let scheduler_id = Self::scheduler_id_for(organisation);
        let queue = PriorityQueue::new(
            scheduler_id.clone(),
            TaskType::Scan,
            ctx.queue_store.clone(),
            QueueOptions {
                maxsize: ctx.config.pq_maxsize,
                allow_priority_updates: true,
                ..QueueOptions::default()
            },
        );

        Self {
            base: Scheduler::new(scheduler_id, organisation, queue, ctx),
            registry,
        }
    }

    pub fn base(&self) -> &Scheduler {
        &self.base
    }

    fn ctx(&self) -> &SchedulerContext {
        self.base.context()
    }

    fn organisation(&self) -> &str {
        self.base.organisation()
    }

    /// 启动事件监听、新插件与重新调度三个循环
    pub async fn run(self: &Arc<Self>) {
        let receiver = self
            .ctx()
            .events
            .subscribe(EventTopic::ScanLevels, self.organisation())
            .await;
        let this = Arc::clone(self);
        self.base
            .spawn_listener("mutations", receiver, move |event| {
                let this = Arc::clone(&this);
                async move {
                    match event {
                        SchedulerEvent::ScanLevel(mutation) => this.handle_mutation(mutation).await,
                        other => {
                            debug!("扫描调度器忽略 {} 事件", other.topic());
                            Ok(())
                        }
                    }
                }
            })
            .await;

        let config = &self.ctx().config;
        let new_plugins_interval = StdDuration::from_secs(config.new_plugins_interval_seconds);
        let reschedule_interval = StdDuration::from_secs(config.reschedule_interval_seconds);

        let this = Arc::clone(self);
        self.base
            .spawn_periodic("new-plugins", new_plugins_interval, move || {
                let this = Arc::clone(&this);
                async move { this.process_new_plugins().await }
            })
            .await;

        let this = Arc::clone(self);
        self.base
            .spawn_periodic("rescheduling", reschedule_interval, move || {
                let this = Arc::clone(&this);
                async move {
                    this.process_rescheduling().await?;
                    this.process_random_objects().await
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

    /// 插件能否对目标运行：插件启用、声明了扫描强度，且目标强度不低于插件要求
    pub fn has_permission(plugin: &Plugin, object: Option<&ScanObject>) -> bool {
        if !plugin.enabled {
            return false;
        }

        let Some(required) = plugin.scan_level else {
            return false;
        };

        match object {
            None => true,
            Some(object) => object.scan_level.is_some_and(|level| level >= required),
        }
    }

    #[instrument(skip(self, mutation), fields(scheduler_id = %self.base.id(), primary_key = %mutation.primary_key))]
    pub async fn handle_mutation(&self, mutation: ScanLevelMutation) -> SchedulerResult<()> {
        let Some(object) = mutation.value else {
            debug!("变更事件 {} 不携带对象，跳过", mutation.id);
            return Ok(());
        };

        if mutation.operation == MutationOperation::Delete {
            let cancelled = self.cancel_object_tasks(&mutation.primary_key).await?;
            info!("对象 {} 已删除，取消了 {} 个排队任务", mutation.primary_key, cancelled);
            return Ok(());
        }

        let plugins = self
            .ctx()
            .catalog
            .get_scan_plugins_by_type(&object.object_type, self.organisation())
            .await?;

        debug!(
            "对象 {} 扫描强度变更，评估 {} 个插件",
            object.primary_key,
            plugins.len()
        );

        self.base
            .evaluate_concurrently("mutations", plugins, |plugin| {
                let object = object.clone();
                async move {
                    self.evaluate_candidate(&plugin, Some(object)).await?;
                    Ok(())
                }
            })
            .await
    }

    /// 从队列移除以该对象为目标的条目，并取消对应任务
    pub async fn cancel_object_tasks(&self, primary_key: &str) -> SchedulerResult<usize> {
        let queue = self.base.queue();
        let mut cancelled = 0;

        for item in queue.list().await? {
            let targets_object = item
                .data
                .get("input_object")
                .and_then(|v| v.as_str())
                .is_some_and(|pk| pk == primary_key);
            if !targets_object {
                continue;
            }

            queue.remove(item.id).await?;
            if let Some(mut task) = self.ctx().task_repo.get_by_id(item.id).await? {
                if task.status == TaskStatus::Queued {
                    task.update_status(TaskStatus::Cancelled);
                    self.ctx().task_repo.update(&task).await?;
                }
            }
            cancelled += 1;
        }

        Ok(cancelled)
    }

    /// 新启用插件：对其消费类型、且扫描强度满足要求的对象逐一评估
    #[instrument(skip(self), fields(scheduler_id = %self.base.id()))]
    pub async fn process_new_plugins(&self) -> SchedulerResult<()> {
        let plugins = self
            .ctx()
            .catalog
            .get_new_scan_plugins(self.organisation())
            .await?;

        for plugin in plugins {
            if plugin.consumes.is_empty() {
                continue;
            }
            let Some(min_level) = plugin.scan_level else {
                debug!("插件 {} 未声明扫描强度，跳过", plugin.id);
                continue;
            };

            let levels: Vec<i32> = (min_level.max(0)..=MAX_SCAN_LEVEL).collect();
            let objects = match self
                .ctx()
                .objects
                .get_objects_by_types(self.organisation(), &plugin.consumes, &levels)
                .await
            {
                Ok(objects) => objects,
                Err(e) => {
                    warn!("获取插件 {} 的目标对象失败: {}", plugin.id, e);
                    continue;
                }
            };

            info!("新插件 {} 匹配到 {} 个对象", plugin.id, objects.len());
            self.base
                .evaluate_concurrently("new_plugins", objects, |object| {
                    let plugin = &plugin;
                    async move {
                        self.evaluate_candidate(plugin, Some(object)).await?;
                        Ok(())
                    }
                })
                .await?;
        }

        Ok(())
    }

    /// 处理到期的调度记录，失效的记录被停用
    #[instrument(skip(self), fields(scheduler_id = %self.base.id()))]
    pub async fn process_rescheduling(&self) -> SchedulerResult<()> {
        let schedules = self
            .ctx()
            .schedule_repo
            .get_expired(self.base.id(), Utc::now())
            .await?;

        if schedules.is_empty() {
            return Ok(());
        }
        debug!("调度器 {} 有 {} 条到期调度记录", self.base.id(), schedules.len());

        self.base
            .evaluate_concurrently("rescheduling", schedules, |schedule| {
                self.reschedule(schedule)
            })
            .await
    }

    async fn reschedule(&self, schedule: Schedule) -> SchedulerResult<()> {
        let task: ScanTask = match serde_json::from_value(schedule.data.clone()) {
            Ok(task) => task,
            Err(e) => {
                return self
                    .disable_schedule(schedule, &format!("负载无法解析: {e}"))
                    .await;
            }
        };

        let Some(plugin) = self
            .ctx()
            .catalog
            .get_plugin(&task.plugin.id, self.organisation())
            .await?
        else {
            return self.disable_schedule(schedule, "插件不存在").await;
        };

        if !plugin.enabled {
            return self.disable_schedule(schedule, "插件已停用").await;
        }

        if plugin.plugin_type != PluginType::Scan {
            debug!("插件 {} 不是扫描插件，跳过调度记录 {}", plugin.id, schedule.id);
            return Ok(());
        }

        let object = match &task.input_object {
            None => None,
            Some(primary_key) => {
                let Some(object) = self
                    .ctx()
                    .objects
                    .get_object(self.organisation(), primary_key)
                    .await?
                else {
                    return self.disable_schedule(schedule, "目标对象不存在").await;
                };

                if !plugin.consumes_type(&object.object_type) {
                    return self
                        .disable_schedule(schedule, "插件不再消费该对象类型")
                        .await;
                }
                Some(object)
            }
        };

        if !Self::has_permission(&plugin, object.as_ref()) {
            return self.disable_schedule(schedule, "插件无权扫描该对象").await;
        }

        self.evaluate_candidate(&plugin, object).await?;
        Ok(())
    }

    async fn disable_schedule(&self, mut schedule: Schedule, reason: &str) -> SchedulerResult<()> {
        schedule.enabled = false;
        schedule.modified_at = Utc::now();
        self.ctx().schedule_repo.update(&schedule).await?;
        StructuredLogger::log_schedule_disabled(self.base.id(), schedule.id, reason);
        Ok(())
    }

    /// 随机抽取对象重新评估，仅在队列有空间时执行
    pub async fn process_random_objects(&self) -> SchedulerResult<()> {
        let count = self.ctx().config.pq_max_random_objects;
        if count == 0 || !self.base.queue().has_space().await? {
            return Ok(());
        }

        let levels: Vec<i32> = (1..=MAX_SCAN_LEVEL).collect();
        let objects = self
            .ctx()
            .objects
            .get_random_objects(self.organisation(), count, &levels)
            .await?;

        let mut candidates = Vec::new();
        for object in objects {
            match self
                .ctx()
                .catalog
                .get_scan_plugins_by_type(&object.object_type, self.organisation())
                .await
            {
                Ok(plugins) => {
                    candidates.extend(plugins.into_iter().map(|plugin| (plugin, object.clone())))
                }
                Err(e) => warn!("获取对象 {} 的插件失败: {}", object.primary_key, e),
            }
        }

        self.base
            .evaluate_concurrently("random_objects", candidates, |(plugin, object)| async move {
                self.evaluate_candidate(&plugin, Some(object)).await?;
                Ok(())
            })
            .await
    }

    /// 评估单个候选，入队成功后向共享同一插件配置的其他租户派生任务
    pub async fn evaluate_candidate(
        &self,
        plugin: &Plugin,
        object: Option<ScanObject>,
    ) -> SchedulerResult<Option<Task>> {
        let input_object = object.as_ref().map(|o| o.primary_key.clone());
        let pushed = self.evaluate_single(plugin, object.as_ref(), None).await?;

        if let Some(origin) = &pushed {
            self.fan_out_duplicates(plugin, input_object.as_deref(), origin)
                .await;
        }
        Ok(pushed)
    }

    async fn evaluate_single(
        &self,
        plugin: &Plugin,
        object: Option<&ScanObject>,
        deduplication_key: Option<Uuid>,
    ) -> SchedulerResult<Option<Task>> {
        let task = ScanTask::new(
            plugin,
            object.map(|o| o.primary_key.clone()),
            self.organisation(),
        );

        if !Self::has_permission(plugin, object) {
            StructuredLogger::log_task_skipped(self.base.id(), &task.hash(), "插件无权扫描该对象");
            return Ok(None);
        }

        let scan_level = object.and_then(|o| o.scan_level);
        self.push_task(task, plugin, scan_level, deduplication_key)
            .await
    }

    async fn fan_out_duplicates(&self, plugin: &Plugin, input_object: Option<&str>, origin: &Task) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };

        let organisations = match self
            .ctx()
            .catalog
            .get_duplicate_organisations(&plugin.id, self.organisation())
            .await
        {
            Ok(organisations) => organisations,
            Err(e) => {
                warn!("获取插件 {} 的共享租户失败: {}", plugin.id, e);
                return;
            }
        };

        for organisation in organisations {
            if organisation == self.organisation() {
                continue;
            }
            let Some(sibling) = registry.scan_scheduler(&organisation).await else {
                debug!("租户 {} 没有扫描调度器，跳过派生", organisation);
                continue;
            };

            if let Err(e) = sibling
                .evaluate_duplicate(&plugin.id, input_object, origin.id)
                .await
            {
                warn!(
                    "向租户 {} 派生任务失败 (来源任务 {}): {}",
                    organisation, origin.id, e
                );
            }
        }
    }

    /// 作为共享租户接收派生任务，插件和对象以本租户的视图为准
    async fn evaluate_duplicate(
        &self,
        plugin_id: &str,
        input_object: Option<&str>,
        origin_id: Uuid,
    ) -> SchedulerResult<Option<Task>> {
        let Some(plugin) = self
            .ctx()
            .catalog
            .get_plugin(plugin_id, self.organisation())
            .await?
        else {
            return Ok(None);
        };

        let object = match input_object {
            None => None,
            Some(primary_key) => {
                match self
                    .ctx()
                    .objects
                    .get_object(self.organisation(), primary_key)
                    .await?
                {
                    Some(object) => Some(object),
                    None => return Ok(None),
                }
            }
        };

        self.evaluate_single(&plugin, object.as_ref(), Some(origin_id))
            .await
    }

    /// 入队前的全部检查；返回 None 表示候选被跳过
    #[instrument(skip(self, task, plugin), fields(scheduler_id = %self.base.id(), plugin_id = %plugin.id))]
    pub async fn push_task(
        &self,
        task: ScanTask,
        plugin: &Plugin,
        scan_level: Option<i32>,
        deduplication_key: Option<Uuid>,
    ) -> SchedulerResult<Option<Task>> {
        let hash = task.hash();
        let grace = plugin
            .interval
            .filter(|minutes| *minutes > 0)
            .map(Duration::minutes)
            .unwrap_or_else(|| self.ctx().grace_period());

        if !self.has_grace_period_passed(&task, grace).await? {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "宽限期未过");
            return Ok(None);
        }

        self.fail_stale_task(&hash).await?;

        if self.is_task_running(&task).await? {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "任务仍在运行");
            return Ok(None);
        }

        if self.base.is_item_on_queue_by_hash(&hash).await? {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "任务已在队列中");
            return Ok(None);
        }

        let now = Utc::now();
        let history = self
            .ctx()
            .task_repo
            .get_by_hash(&hash, RANK_HISTORY_LIMIT)
            .await?;
        let priority = HistoryRanker::new(grace).rank(
            &RankInput::at(now)
                .with_history(&history)
                .with_scan_level(scan_level),
        );
        if priority < 0 {
            StructuredLogger::log_task_skipped(self.base.id(), &hash, "排序结果为不可入队");
            return Ok(None);
        }

        let item = PrioritizedItem::from_payload(self.base.id(), priority, &task)?;
        let options = PushOptions {
            deduplication_key,
            recurrence: Some(Recurrence {
                cron: plugin.cron.clone(),
                interval: plugin.interval.filter(|m| *m > 0).map(Duration::minutes),
            }),
        };

        let config = &self.ctx().config;
        match self
            .base
            .push_item_to_queue_with_timeout(
                item,
                options,
                config.push_max_tries,
                self.ctx().push_poll_interval(),
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

    /// 任务存储与原始数据存储都显示最近一次运行已超过宽限期
    async fn has_grace_period_passed(&self, task: &ScanTask, grace: Duration) -> SchedulerResult<bool> {
        let now = Utc::now();

        if let Some(latest) = self.ctx().task_repo.get_latest_by_hash(&task.hash()).await? {
            if now - latest.modified_at < grace {
                return Ok(false);
            }
        }

        let last_run = self
            .ctx()
            .artifacts
            .get_last_run(
                &task.plugin.id,
                task.input_object.as_deref(),
                self.organisation(),
            )
            .await?;
        if let Some(ended_at) = last_run.and_then(|run| run.ended_at) {
            if now - ended_at < grace {
                return Ok(false);
            }
        }

        Ok(true)
    }

    /// 已分发但超过宽限期没有进展的任务视为卡死，标记为失败
    async fn fail_stale_task(&self, hash: &str) -> SchedulerResult<()> {
        let Some(mut latest) = self.ctx().task_repo.get_latest_by_hash(hash).await? else {
            return Ok(());
        };

        if latest.status == TaskStatus::Dispatched
            && latest.modified_at + self.ctx().grace_period() < Utc::now()
        {
            let last_modified = latest.modified_at;
            latest.update_status(TaskStatus::Failed);
            self.ctx().task_repo.update(&latest).await?;
            StructuredLogger::log_stale_task_failed(self.base.id(), latest.id, hash, last_modified);
        }
        Ok(())
    }

    async fn is_task_running(&self, task: &ScanTask) -> SchedulerResult<bool> {
        if let Some(latest) = self.ctx().task_repo.get_latest_by_hash(&task.hash()).await? {
            if !latest.is_terminal() {
                return Ok(true);
            }
        }

        let last_run = self
            .ctx()
            .artifacts
            .get_last_run(
                &task.plugin.id,
                task.input_object.as_deref(),
                self.organisation(),
            )
            .await?;

        Ok(last_run.is_some_and(|run| run.is_running()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(scan_level: Option<i32>, enabled: bool) -> Plugin {
        Plugin {
            id: "dns-records".into(),
            name: None,
            plugin_type: PluginType::Scan,
            version: None,
            enabled,
            consumes: vec!["Hostname".into()],
            produces: vec![],
            scan_level,
            interval: None,
            cron: None,
        }
    }

    fn object(scan_level: Option<i32>) -> ScanObject {
        ScanObject {
            primary_key: "Hostname|internet|example.com".into(),
            object_type: "Hostname".into(),
            scan_level,
        }
    }

    #[test]
    fn test_permission_requires_enabled_plugin_with_level() {
        assert!(!ScanScheduler::has_permission(&plugin(Some(1), false), None));
        assert!(!ScanScheduler::has_permission(&plugin(None, true), None));
        assert!(ScanScheduler::has_permission(&plugin(Some(1), true), None));
    }

    #[test]
    fn test_permission_compares_object_level() {
        let p = plugin(Some(2), true);
        assert!(!ScanScheduler::has_permission(&p, Some(&object(Some(1)))));
        assert!(!ScanScheduler::has_permission(&p, Some(&object(None))));
        assert!(ScanScheduler::has_permission(&p, Some(&object(Some(2)))));
        assert!(ScanScheduler::has_permission(&p, Some(&object(Some(4)))));
    }
}
