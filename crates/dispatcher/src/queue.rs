//! 持久化优先级队列
//!
//! 同一队列上的写操作由队列级互斥锁串行化，存储层的 upsert/pop
//! 本身也是单条语句，保证跨进程调用方之间的原子性。

use std::sync::Arc;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{FilterRequest, PrioritizedItem, QueueStore, TaskStatus, TaskType};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, instrument};
use uuid::Uuid;

/// 队列满时仍可插队的最高优先级（数值越小越优先）
pub const PRIORITY_OVERRIDE_THRESHOLD: i64 = 1;

#[derive(Debug, Clone, Copy, Default)]
pub struct QueueOptions {
    /// 0 表示不限容量
    pub maxsize: usize,
    pub allow_replace: bool,
    pub allow_updates: bool,
    pub allow_priority_updates: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueDescription {
    pub id: String,
    pub size: i64,
    pub maxsize: usize,
    pub item_type: TaskType,
    pub allow_replace: bool,
    pub allow_updates: bool,
    pub allow_priority_updates: bool,
}

pub struct PriorityQueue {
    pq_id: String,
    item_type: TaskType,
    options: QueueOptions,
    store: Arc<dyn QueueStore>,
    lock: Mutex<()>,
}

impl std::fmt::Debug for PriorityQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PriorityQueue")
            .field("pq_id", &self.pq_id)
            .field("item_type", &self.item_type)
            .field("options", &self.options)
            .finish()
    }
}

impl PriorityQueue {
    pub fn new(
        pq_id: impl Into<String>,
        item_type: TaskType,
        store: Arc<dyn QueueStore>,
        options: QueueOptions,
    ) -> Self {
        Self {
            pq_id: pq_id.into(),
            item_type,
            options,
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.pq_id
    }

    pub fn item_type(&self) -> TaskType {
        self.item_type
    }

    pub fn maxsize(&self) -> usize {
        self.options.maxsize
    }

    pub fn options(&self) -> QueueOptions {
        self.options
    }

    /// 校验负载并计算其身份哈希
    pub fn create_hash(&self, item: &PrioritizedItem) -> SchedulerResult<String> {
        self.item_type.validate_payload(&item.data)
    }

    #[instrument(skip(self, item), fields(queue_id = %self.pq_id, item_id = %item.id))]
    pub async fn push(&self, mut item: PrioritizedItem) -> SchedulerResult<PrioritizedItem> {
        let _guard = self.lock.lock().await;

        let hash = self.create_hash(&item)?;
        let priority = item
            .priority
            .ok_or_else(|| SchedulerError::InvalidItem("队列项必须带有优先级".to_string()))?;

        if self.is_full_unlocked().await? && priority > PRIORITY_OVERRIDE_THRESHOLD {
            return Err(SchedulerError::QueueFull {
                queue_id: self.pq_id.clone(),
            });
        }

        let on_queue = self.store.get_queued_by_hash(&self.pq_id, &hash).await?;
        if let Some(existing) = &on_queue {
            let item_changed = data_without_id(existing) != data_without_id(&item);
            let priority_changed = existing.priority != Some(priority);

            let allowed = self.options.allow_replace
                || (self.options.allow_updates && item_changed)
                || (self.options.allow_priority_updates && priority_changed);

            if !allowed {
                let message = if priority_changed && !self.options.allow_priority_updates {
                    format!("队列 {} 中已有相同任务，且不允许更新优先级", self.pq_id)
                } else if item_changed && !self.options.allow_updates {
                    format!("队列 {} 中已有相同任务，且不允许更新任务内容", self.pq_id)
                } else {
                    format!("队列 {} 中已有相同任务，且不允许替换", self.pq_id)
                };
                return Err(SchedulerError::NotAllowed(message));
            }

            // 更新已在队列中的条目时沿用其 id
            item.id = existing.id;
            item.created_at = existing.created_at;
            set_payload_id(&mut item.data, existing.id);
        }

        item.scheduler_id = self.pq_id.clone();
        item.hash = Some(hash);
        item.status = TaskStatus::Queued;

        let stored = self.store.upsert(&item).await?;
        debug!(
            "队列 {} 写入条目 {} (优先级 {}, 更新: {})",
            self.pq_id,
            stored.id,
            priority,
            on_queue.is_some()
        );
        Ok(stored)
    }

    /// 取出最优先的条目并标记为已分发
    ///
    /// 队列为空时返回 `QueueEmpty`；过滤条件不匹配时返回空列表。
    #[instrument(skip(self, filters), fields(queue_id = %self.pq_id))]
    pub async fn pop(
        &self,
        filters: Option<&FilterRequest>,
        limit: i64,
    ) -> SchedulerResult<Vec<PrioritizedItem>> {
        let _guard = self.lock.lock().await;

        if self.store.qsize(&self.pq_id).await? == 0 {
            return Err(SchedulerError::QueueEmpty {
                queue_id: self.pq_id.clone(),
            });
        }

        let limit = limit.max(1);
        let filters = filters.filter(|f| !f.is_empty());
        self.store.pop(&self.pq_id, filters, limit).await
    }

    pub async fn peek(&self, index: i64) -> SchedulerResult<Option<PrioritizedItem>> {
        self.store.peek(&self.pq_id, index).await
    }

    pub async fn remove(&self, id: Uuid) -> SchedulerResult<()> {
        let _guard = self.lock.lock().await;
        self.store.remove(&self.pq_id, id).await
    }

    pub async fn clear(&self) -> SchedulerResult<u64> {
        let _guard = self.lock.lock().await;
        self.store.clear(&self.pq_id).await
    }

    pub async fn qsize(&self) -> SchedulerResult<i64> {
        self.store.qsize(&self.pq_id).await
    }

    pub async fn is_empty(&self) -> SchedulerResult<bool> {
        Ok(self.qsize().await? == 0)
    }

    pub async fn is_full(&self) -> SchedulerResult<bool> {
        self.is_full_unlocked().await
    }

    pub async fn has_space(&self) -> SchedulerResult<bool> {
        Ok(!self.is_full_unlocked().await?)
    }

    async fn is_full_unlocked(&self) -> SchedulerResult<bool> {
        if self.options.maxsize == 0 {
            return Ok(false);
        }
        let size = self.store.qsize(&self.pq_id).await?;
        Ok(size >= self.options.maxsize as i64)
    }

    pub async fn contains_by_hash(&self, hash: &str) -> SchedulerResult<bool> {
        Ok(self.store.get_queued_by_hash(&self.pq_id, hash).await?.is_some())
    }

    pub async fn get_by_hash(&self, hash: &str) -> SchedulerResult<Option<PrioritizedItem>> {
        self.store.get_queued_by_hash(&self.pq_id, hash).await
    }

    pub async fn list(&self) -> SchedulerResult<Vec<PrioritizedItem>> {
        self.store.list_queued(&self.pq_id).await
    }

    pub async fn describe(&self) -> SchedulerResult<QueueDescription> {
        Ok(QueueDescription {
            id: self.pq_id.clone(),
            size: self.qsize().await?,
            maxsize: self.options.maxsize,
            item_type: self.item_type,
            allow_replace: self.options.allow_replace,
            allow_updates: self.options.allow_updates,
            allow_priority_updates: self.options.allow_priority_updates,
        })
    }
}

/// 负载中的 `id` 与条目 id 保持一致
pub fn set_payload_id(data: &mut serde_json::Value, id: Uuid) {
    if let Some(object) = data.as_object_mut() {
        object.insert("id".to_string(), serde_json::Value::String(id.to_string()));
    }
}

/// 比较负载内容时忽略每次尝试各不相同的 id
fn data_without_id(item: &PrioritizedItem) -> serde_json::Value {
    let mut data = item.data.clone();
    if let Some(object) = data.as_object_mut() {
        object.remove("id");
    }
    data
}
