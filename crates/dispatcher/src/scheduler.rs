//! 调度器基础设施
//!
//! 每个调度器拥有一个优先级队列和若干后台循环，具体调度策略
//! (扫描、后处理、报告) 复用这里的入队/出队生命周期。

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use scheduler_core::{SchedulerConfig, SchedulerError, SchedulerResult};
use scheduler_domain::{
    ArtifactService, CatalogService, FilterRequest, ObjectService, PrioritizedItem, QueueStore,
    Schedule, ScheduleRepository, Task, TaskRepository, TaskStatus, TaskType,
};
use scheduler_infrastructure::{
    EventBus, EventReceiver, MetricsCollector, SchedulerEvent, StructuredLogger,
};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cron_utils::calculate_deadline;
use crate::queue::{set_payload_id, PriorityQueue, QueueDescription, PRIORITY_OVERRIDE_THRESHOLD};

/// 调度器共享的依赖
#[derive(Clone)]
pub struct SchedulerContext {
    pub config: SchedulerConfig,
    pub task_repo: Arc<dyn TaskRepository>,
    pub schedule_repo: Arc<dyn ScheduleRepository>,
    pub queue_store: Arc<dyn QueueStore>,
    pub catalog: Arc<dyn CatalogService>,
    pub objects: Arc<dyn ObjectService>,
    pub artifacts: Arc<dyn ArtifactService>,
    pub events: Arc<EventBus>,
    pub metrics: MetricsCollector,
}

impl SchedulerContext {
    pub fn grace_period(&self) -> Duration {
        Duration::seconds(self.config.pq_grace_period_seconds as i64)
    }

    pub fn default_interval(&self) -> Duration {
        Duration::seconds(self.config.default_schedule_interval_seconds as i64)
    }

    pub fn push_poll_interval(&self) -> StdDuration {
        StdDuration::from_millis(self.config.push_poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> StdDuration {
        StdDuration::from_secs(self.config.stop_timeout_seconds)
    }
}

/// 任务重复执行的周期
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Recurrence {
    pub cron: Option<String>,
    pub interval: Option<Duration>,
}

#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub deduplication_key: Option<Uuid>,
    /// 为空表示一次性任务，调度记录不设截止时间
    pub recurrence: Option<Recurrence>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerDescription {
    pub id: String,
    pub organisation: String,
    pub kind: TaskType,
    pub enabled: bool,
    pub priority_queue: QueueDescription,
    pub last_activity: Option<DateTime<Utc>>,
}

struct LoopState {
    token: CancellationToken,
    handles: Vec<(String, JoinHandle<()>)>,
}

pub struct Scheduler {
    scheduler_id: String,
    organisation: String,
    queue: PriorityQueue,
    ctx: SchedulerContext,
    enabled: AtomicBool,
    loops: Mutex<LoopState>,
    last_activity: RwLock<Option<DateTime<Utc>>>,
}

impl Scheduler {
    pub fn new(
        scheduler_id: impl Into<String>,
        organisation: impl Into<String>,
        queue: PriorityQueue,
        ctx: SchedulerContext,
    ) -> Self {
        Self {
            scheduler_id: scheduler_id.into(),
            organisation: organisation.into(),
            queue,
            ctx,
            enabled: AtomicBool::new(true),
            loops: Mutex::new(LoopState {
                token: CancellationToken::new(),
                handles: Vec::new(),
            }),
            last_activity: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.scheduler_id
    }

    pub fn organisation(&self) -> &str {
        &self.organisation
    }

    pub fn queue(&self) -> &PriorityQueue {
        &self.queue
    }

    pub fn context(&self) -> &SchedulerContext {
        &self.ctx
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// 切换为启用状态；原本已启用时返回 false
    pub async fn mark_enabled(&self) -> bool {
        if self.enabled.swap(true, Ordering::SeqCst) {
            debug!("调度器 {} 已处于启用状态", self.scheduler_id);
            return false;
        }
        let mut loops = self.loops.lock().await;
        loops.token = CancellationToken::new();
        true
    }

    async fn touch(&self) {
        *self.last_activity.write().await = Some(Utc::now());
    }

    /// 启动一个周期循环；每轮失败只记录日志，下一轮照常执行
    pub async fn spawn_periodic<F, Fut>(&self, name: &str, interval: StdDuration, job: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        let mut loops = self.loops.lock().await;
        let token = loops.token.clone();
        let loop_name = format!("{}-{}", self.scheduler_id, name);
        let task_name = loop_name.clone();

        let handle = tokio::spawn(async move {
            debug!("周期循环 {} 已启动", task_name);
            loop {
                if token.is_cancelled() {
                    break;
                }
                if let Err(e) = job().await {
                    if e.is_storage() {
                        error!("周期循环 {} 本轮因存储错误中止: {}", task_name, e);
                    } else {
                        warn!("周期循环 {} 本轮执行失败: {}", task_name, e);
                    }
                }
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            debug!("周期循环 {} 已退出", task_name);
        });
        loops.handles.push((loop_name, handle));
    }

    /// 启动一个事件监听循环，每条事件调用一次处理函数
    pub async fn spawn_listener<F, Fut>(&self, name: &str, receiver: EventReceiver, handler: F)
    where
        F: Fn(SchedulerEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = SchedulerResult<()>> + Send + 'static,
    {
        let mut loops = self.loops.lock().await;
        let token = loops.token.clone();
        let loop_name = format!("{}-{}", self.scheduler_id, name);
        let task_name = loop_name.clone();

        let handle = tokio::spawn(async move {
            debug!("事件监听 {} 已启动", task_name);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = receiver.recv() => match event {
                        Some(event) => {
                            if let Err(e) = handler(event).await {
                                warn!("事件监听 {} 处理事件失败: {}", task_name, e);
                            }
                        }
                        None => {
                            info!("事件监听 {} 的通道已关闭", task_name);
                            break;
                        }
                    }
                }
            }
            debug!("事件监听 {} 已退出", task_name);
        });
        loops.handles.push((loop_name, handle));
    }

    pub async fn loop_count(&self) -> usize {
        self.loops.lock().await.handles.len()
    }

    /// 停止所有后台循环，超过停止超时的循环被强制中止
    pub async fn stop(&self) {
        let handles = {
            let mut loops = self.loops.lock().await;
            loops.token.cancel();
            std::mem::take(&mut loops.handles)
        };

        let timeout = self.ctx.stop_timeout();
        for (name, handle) in handles {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(_) => debug!("循环 {} 已停止", name),
                Err(_) => {
                    warn!("循环 {} 未在 {:?} 内退出，强制中止", name, timeout);
                    abort.abort();
                }
            }
        }
    }

    /// 停用：停止循环、清空队列并取消仍在排队的任务；已分发的任务不受影响
    #[instrument(skip(self), fields(scheduler_id = %self.scheduler_id))]
    pub async fn disable(&self) -> SchedulerResult<()> {
        if !self.enabled.swap(false, Ordering::SeqCst) {
            debug!("调度器 {} 已处于停用状态", self.scheduler_id);
            return Ok(());
        }

        info!("正在停用调度器: {}", self.scheduler_id);
        self.stop().await;

        let removed = self.queue.clear().await?;
        let cancelled = self.ctx.task_repo.cancel_queued(&self.scheduler_id).await?;

        StructuredLogger::log_scheduler_disabled(&self.scheduler_id, removed, cancelled);
        Ok(())
    }

    /// 入队并持久化：写队列、更新调度记录、创建 QUEUED 状态的任务
    #[instrument(skip(self, item, options), fields(scheduler_id = %self.scheduler_id, item_id = %item.id))]
    pub async fn push_item_to_queue(
        &self,
        mut item: PrioritizedItem,
        options: PushOptions,
    ) -> SchedulerResult<Task> {
        if !self.is_enabled() {
            return Err(SchedulerError::NotAllowed(format!(
                "调度器 {} 已停用，不能入队",
                self.scheduler_id
            )));
        }

        // 任务 id 必须与负载 id 一致且未被使用
        if item.payload_id() != Some(item.id) || self.ctx.task_repo.get_by_id(item.id).await?.is_some() {
            let new_id = Uuid::new_v4();
            debug!("任务 id {} 已存在或与负载不一致，重新生成为 {}", item.id, new_id);
            item.id = new_id;
            set_payload_id(&mut item.data, new_id);
        }
        item.scheduler_id = self.scheduler_id.clone();

        let stored = self.queue.push(item).await?;
        self.upsert_schedule(&stored, options.recurrence.as_ref()).await?;

        let task = match self.ctx.task_repo.get_by_id(stored.id).await? {
            Some(mut existing) => {
                existing.priority = stored.priority.unwrap_or(existing.priority);
                existing.data = stored.data.clone();
                existing.modified_at = Utc::now();
                self.ctx.task_repo.update(&existing).await?
            }
            None => {
                let mut task = Task::from_item(&stored, &self.organisation, self.queue.item_type());
                task.deduplication_key = options.deduplication_key;
                task.update_status(TaskStatus::Queued);
                self.ctx.task_repo.create(&task).await?
            }
        };

        self.ctx.metrics.record_push(&self.scheduler_id);
        StructuredLogger::log_task_pushed(&self.scheduler_id, task.id, &task.hash, task.priority);
        self.touch().await;
        Ok(task)
    }

    async fn upsert_schedule(
        &self,
        item: &PrioritizedItem,
        recurrence: Option<&Recurrence>,
    ) -> SchedulerResult<Schedule> {
        let mut schedule = Schedule::new(
            self.scheduler_id.clone(),
            self.organisation.clone(),
            item.hash_or_empty(),
            item.data.clone(),
        );

        if let Some(recurrence) = recurrence {
            schedule.schedule = recurrence.cron.clone();
            schedule.interval_seconds = recurrence.interval.map(|i| i.num_seconds());
            schedule.deadline_at = Some(calculate_deadline(
                recurrence.cron.as_deref(),
                recurrence.interval,
                self.ctx.default_interval(),
                Utc::now(),
            )?);
        }

        self.ctx.schedule_repo.upsert_by_hash(&schedule).await
    }

    /// 队列满时按轮询间隔重试，`max_tries == -1` 表示无限重试
    pub async fn push_item_to_queue_with_timeout(
        &self,
        item: PrioritizedItem,
        options: PushOptions,
        max_tries: i64,
        poll_interval: StdDuration,
    ) -> SchedulerResult<Task> {
        let can_override = item
            .priority
            .is_some_and(|p| p <= PRIORITY_OVERRIDE_THRESHOLD);

        let mut tries: i64 = 0;
        while !can_override && !self.queue.has_space().await? {
            if max_tries != -1 && tries >= max_tries {
                return Err(SchedulerError::QueueFull {
                    queue_id: self.queue.id().to_string(),
                });
            }
            debug!(
                "队列 {} 已满，等待空间 (第 {} 次)",
                self.queue.id(),
                tries + 1
            );
            tokio::time::sleep(poll_interval).await;
            tries += 1;
        }

        self.push_item_to_queue(item, options).await
    }

    /// 批量入队，预期内的拒绝被跳过；返回成功数量
    pub async fn push_items_to_queue(&self, items: Vec<PrioritizedItem>) -> SchedulerResult<usize> {
        let mut count = 0;
        for item in items {
            let hash = item.hash_or_empty().to_string();
            match self.push_item_to_queue(item, PushOptions::default()).await {
                Ok(_) => count += 1,
                Err(e) if e.is_push_rejection() => {
                    self.record_rejection(&hash, &e);
                }
                Err(e) => {
                    error!("调度器 {} 批量入队失败: {}", self.scheduler_id, e);
                    return Err(e);
                }
            }
        }
        Ok(count)
    }

    pub fn record_rejection(&self, hash: &str, error: &SchedulerError) {
        let reason = match error {
            SchedulerError::QueueFull { .. } => "queue_full",
            SchedulerError::NotAllowed(_) => "not_allowed",
            SchedulerError::InvalidItem(_) => "invalid_item",
            _ => "other",
        };
        self.ctx.metrics.record_rejection(&self.scheduler_id, reason);
        StructuredLogger::log_task_skipped(&self.scheduler_id, hash, &error.to_string());
    }

    /// 出队并把对应任务标记为 DISPATCHED
    #[instrument(skip(self, filters), fields(scheduler_id = %self.scheduler_id))]
    pub async fn pop_item_from_queue(
        &self,
        filters: Option<&FilterRequest>,
        limit: i64,
    ) -> SchedulerResult<Vec<Task>> {
        if !self.is_enabled() {
            return Err(SchedulerError::NotAllowed(format!(
                "调度器 {} 已停用，不能出队",
                self.scheduler_id
            )));
        }

        let items = self.queue.pop(filters, limit).await?;
        let mut tasks = Vec::with_capacity(items.len());
        for item in &items {
            let task = match self.ctx.task_repo.get_by_id(item.id).await? {
                Some(mut task) => {
                    task.update_status(TaskStatus::Dispatched);
                    self.ctx.task_repo.update(&task).await?
                }
                None => {
                    warn!("出队的条目 {} 没有对应的任务记录，补建任务", item.id);
                    let mut task = Task::from_item(item, &self.organisation, self.queue.item_type());
                    task.update_status(TaskStatus::Dispatched);
                    self.ctx.task_repo.create(&task).await?
                }
            };
            tasks.push(task);
        }

        if !tasks.is_empty() {
            let ids: Vec<Uuid> = tasks.iter().map(|t| t.id).collect();
            self.ctx.metrics.record_pop(&self.scheduler_id, ids.len());
            StructuredLogger::log_task_popped(&self.scheduler_id, &ids);
            self.touch().await;
        }
        Ok(tasks)
    }

    pub async fn is_item_on_queue_by_hash(&self, hash: &str) -> SchedulerResult<bool> {
        self.queue.contains_by_hash(hash).await
    }

    /// 以有界并发评估候选任务
    ///
    /// 单个候选的失败只记录日志；出现存储错误时在全部候选结束后返回该错误。
    pub async fn evaluate_concurrently<T, F, Fut>(
        &self,
        caller: &str,
        candidates: Vec<T>,
        evaluate: F,
    ) -> SchedulerResult<()>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = SchedulerResult<()>>,
    {
        if candidates.is_empty() {
            return Ok(());
        }

        let total = candidates.len();
        let results: Vec<SchedulerResult<()>> = stream::iter(candidates)
            .map(evaluate)
            .buffer_unordered(self.ctx.config.worker_pool_size.max(1))
            .collect()
            .await;

        let mut storage_error = None;
        let mut failed = 0;
        for result in results {
            if let Err(e) = result {
                failed += 1;
                if e.is_storage() {
                    error!("调度器 {} ({}) 候选评估出现存储错误: {}", self.scheduler_id, caller, e);
                    storage_error.get_or_insert(e);
                } else {
                    warn!("调度器 {} ({}) 候选评估失败: {}", self.scheduler_id, caller, e);
                }
            }
        }

        debug!(
            "调度器 {} ({}) 评估候选 {} 个，失败 {} 个",
            self.scheduler_id, caller, total, failed
        );
        storage_error.map_or(Ok(()), Err)
    }

    pub async fn describe(&self) -> SchedulerResult<SchedulerDescription> {
        Ok(SchedulerDescription {
            id: self.scheduler_id.clone(),
            organisation: self.organisation.clone(),
            kind: self.queue.item_type(),
            enabled: self.is_enabled(),
            priority_queue: self.queue.describe().await?,
            last_activity: *self.last_activity.read().await,
        })
    }
}
