use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::payloads::{PostProcessTask, ReportTask, ScanTask, TaskPayload};

/// 任务状态机
///
/// `PENDING → QUEUED → DISPATCHED → RUNNING → {COMPLETED | FAILED}`，
/// `CANCELLED` 可从 QUEUED/DISPATCHED/RUNNING 进入。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Queued,
    Dispatched,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 7] = [
        TaskStatus::Pending,
        TaskStatus::Queued,
        TaskStatus::Dispatched,
        TaskStatus::Running,
        TaskStatus::Completed,
        TaskStatus::Failed,
        TaskStatus::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Queued => "queued",
            TaskStatus::Dispatched => "dispatched",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    /// 外部调用方（API、worker 回调）允许的状态迁移
    pub fn can_transition_to(&self, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, to),
            (Pending, Queued | Cancelled | Failed)
                | (Queued, Dispatched | Cancelled | Failed)
                | (Dispatched, Running | Completed | Failed | Cancelled)
                | (Running, Completed | Failed | Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| SchedulerError::Serialization(format!("无效的任务状态: {s}")))
    }
}

/// 任务种类，同时决定队列项负载的校验方式
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    Scan,
    PostProcess,
    Report,
}

impl TaskType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskType::Scan => "scan",
            TaskType::PostProcess => "post_process",
            TaskType::Report => "report",
        }
    }

    /// 校验负载是否符合该任务类型，返回规范化的内容哈希
    pub fn validate_payload(&self, data: &serde_json::Value) -> SchedulerResult<String> {
        fn hash_of<T: TaskPayload>(data: &serde_json::Value) -> SchedulerResult<String> {
            let payload: T = serde_json::from_value(data.clone())
                .map_err(|e| SchedulerError::InvalidItem(format!("负载格式错误: {e}")))?;
            Ok(payload.hash())
        }

        match self {
            TaskType::Scan => hash_of::<ScanTask>(data),
            TaskType::PostProcess => hash_of::<PostProcessTask>(data),
            TaskType::Report => hash_of::<ReportTask>(data),
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scan" => Ok(TaskType::Scan),
            "post_process" => Ok(TaskType::PostProcess),
            "report" => Ok(TaskType::Report),
            _ => Err(SchedulerError::Serialization(format!("无效的任务类型: {s}"))),
        }
    }
}

/// 优先级队列中的条目
///
/// 入队前 `hash` 可以为空，由队列根据负载计算；出队后成为同 id 的 Task。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PrioritizedItem {
    pub id: Uuid,
    pub scheduler_id: String,
    pub hash: Option<String>,
    pub priority: Option<i64>,
    pub data: serde_json::Value,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl PrioritizedItem {
    pub fn new(scheduler_id: impl Into<String>, priority: i64, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scheduler_id: scheduler_id.into(),
            hash: None,
            priority: Some(priority),
            data,
            status: TaskStatus::Pending,
            created_at: now,
            modified_at: now,
        }
    }

    /// 从负载构造条目，id 与负载 id 保持一致
    pub fn from_payload<P: TaskPayload>(
        scheduler_id: impl Into<String>,
        priority: i64,
        payload: &P,
    ) -> SchedulerResult<Self> {
        let data = serde_json::to_value(payload)
            .map_err(|e| SchedulerError::Serialization(format!("序列化任务负载失败: {e}")))?;
        let mut item = Self::new(scheduler_id, priority, data);
        item.id = payload.id();
        item.hash = Some(payload.hash());
        Ok(item)
    }

    pub fn hash_or_empty(&self) -> &str {
        self.hash.as_deref().unwrap_or_default()
    }

    /// 负载中记录的 id（若有）
    pub fn payload_id(&self) -> Option<Uuid> {
        self.data
            .get("id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}

/// 一次任务执行尝试
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: Uuid,
    pub scheduler_id: String,
    pub organisation: String,
    pub task_type: TaskType,
    pub hash: String,
    pub priority: i64,
    pub status: TaskStatus,
    pub data: serde_json::Value,
    /// 跨租户同源任务的关联键，等于发起任务的 id
    pub deduplication_key: Option<Uuid>,
    pub meta: Option<serde_json::Value>,
    /// 各状态停留时长（秒）
    pub pending: Option<f64>,
    pub queued: Option<f64>,
    pub dispatched: Option<f64>,
    pub running: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Task {
    pub fn from_item(item: &PrioritizedItem, organisation: &str, task_type: TaskType) -> Self {
        let now = Utc::now();
        Self {
            id: item.id,
            scheduler_id: item.scheduler_id.clone(),
            organisation: organisation.to_string(),
            task_type,
            hash: item.hash_or_empty().to_string(),
            priority: item.priority.unwrap_or_default(),
            status: TaskStatus::Pending,
            data: item.data.clone(),
            deduplication_key: None,
            meta: None,
            pending: None,
            queued: None,
            dispatched: None,
            running: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// 更新状态并记录离开状态的停留时长
    pub fn update_status(&mut self, to: TaskStatus) {
        self.update_status_at(to, Utc::now());
    }

    pub fn update_status_at(&mut self, to: TaskStatus, now: DateTime<Utc>) {
        let spent: f64 = [self.pending, self.queued, self.dispatched, self.running]
            .iter()
            .flatten()
            .sum();
        let entered_at = self.created_at + chrono::Duration::milliseconds((spent * 1000.0) as i64);
        let elapsed = ((now - entered_at).num_milliseconds().max(0) as f64) / 1000.0;

        match self.status {
            TaskStatus::Pending if to != TaskStatus::Pending => self.pending = Some(elapsed),
            TaskStatus::Queued if to != TaskStatus::Queued => self.queued = Some(elapsed),
            TaskStatus::Dispatched if to != TaskStatus::Dispatched => {
                self.dispatched = Some(elapsed)
            }
            TaskStatus::Running if to != TaskStatus::Running => self.running = Some(elapsed),
            _ => {}
        }

        self.status = to;
        self.modified_at = now;
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (调度器: {}, 类型: {}, 状态: {})",
            self.id, self.scheduler_id, self.task_type, self.status
        )
    }
}

/// 周期性任务的调度记录，以内容哈希为身份
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Schedule {
    pub id: Uuid,
    pub scheduler_id: String,
    pub organisation: String,
    pub hash: String,
    pub data: serde_json::Value,
    /// cron 表达式，优先于 `interval_seconds`
    pub schedule: Option<String>,
    pub interval_seconds: Option<i64>,
    pub enabled: bool,
    pub deadline_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Schedule {
    pub fn new(
        scheduler_id: impl Into<String>,
        organisation: impl Into<String>,
        hash: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            scheduler_id: scheduler_id.into(),
            organisation: organisation.into(),
            hash: hash.into(),
            data,
            schedule: None,
            interval_seconds: None,
            enabled: true,
            deadline_at: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.enabled && self.deadline_at.is_some_and(|deadline| deadline < now)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Organisation {
    pub id: String,
    pub name: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn sample_task() -> Task {
        let item = PrioritizedItem::new("scan-org1", 10, json!({"id": Uuid::new_v4()}));
        Task::from_item(&item, "org1", TaskType::Scan)
    }

    #[test]
    fn test_status_serialization_and_parsing() {
        assert_eq!(
            serde_json::to_value(TaskStatus::Dispatched).unwrap(),
            json!("dispatched")
        );
        assert_eq!("QUEUED".parse::<TaskStatus>().unwrap(), TaskStatus::Queued);
        assert!("unknown".parse::<TaskStatus>().is_err());
        assert_eq!(
            "post_process".parse::<TaskType>().unwrap(),
            TaskType::PostProcess
        );
    }

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Dispatched));
        assert!(TaskStatus::Dispatched.can_transition_to(TaskStatus::Running));
        assert!(TaskStatus::Running.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Cancelled));
        assert!(!TaskStatus::Completed.can_transition_to(TaskStatus::Running));
        assert!(!TaskStatus::Cancelled.can_transition_to(TaskStatus::Queued));
        assert!(!TaskStatus::Queued.can_transition_to(TaskStatus::Completed));
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Dispatched.is_terminal());
    }

    #[test]
    fn test_update_status_records_durations() {
        let mut task = sample_task();
        let t0 = task.created_at;

        task.update_status_at(TaskStatus::Queued, t0 + Duration::seconds(2));
        assert_eq!(task.pending, Some(2.0));

        task.update_status_at(TaskStatus::Dispatched, t0 + Duration::seconds(7));
        assert_eq!(task.queued, Some(5.0));

        task.update_status_at(TaskStatus::Running, t0 + Duration::seconds(8));
        task.update_status_at(TaskStatus::Completed, t0 + Duration::seconds(20));
        assert_eq!(task.dispatched, Some(1.0));
        assert_eq!(task.running, Some(12.0));
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.modified_at, t0 + Duration::seconds(20));
    }

    #[test]
    fn test_schedule_expiry() {
        let now = Utc::now();
        let mut schedule = Schedule::new("report-org1", "org1", "abc", json!({}));
        assert!(!schedule.is_expired(now));

        schedule.deadline_at = Some(now - Duration::seconds(1));
        assert!(schedule.is_expired(now));

        schedule.enabled = false;
        assert!(!schedule.is_expired(now));
    }
}
