//! 任务优先级计算
//!
//! 数值越小越优先。负数是保留的哨兵值，表示当前不应入队。

use chrono::{DateTime, Duration, Utc};
use scheduler_domain::{Task, TaskStatus};

/// 不可入队
pub const INELIGIBLE: i64 = -1;

/// 没有历史记录的任务
pub const FIRST_RUN_PRIORITY: i64 = 2;

const BASE_PRIORITY: i64 = 3;
const MAX_AGE_SCORE: f64 = 1000.0;
const AGE_HORIZON_DAYS: i64 = 7;
const FAILURE_PENALTY: i64 = 250;
const MAX_FAILURE_PENALTY: i64 = 1000;
const MAX_SCAN_LEVEL: i32 = 4;

#[derive(Debug, Clone)]
pub struct RankInput<'a> {
    /// 同一哈希的历史任务，最新在前
    pub prior_tasks: &'a [Task],
    pub scan_level: Option<i32>,
    /// 截止时间排序使用的参考时间
    pub deadline: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl<'a> RankInput<'a> {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self {
            prior_tasks: &[],
            scan_level: None,
            deadline: now,
            now,
        }
    }

    pub fn with_history(mut self, prior_tasks: &'a [Task]) -> Self {
        self.prior_tasks = prior_tasks;
        self
    }

    pub fn with_scan_level(mut self, scan_level: Option<i32>) -> Self {
        self.scan_level = scan_level;
        self
    }

    pub fn with_deadline(mut self, deadline: DateTime<Utc>) -> Self {
        self.deadline = deadline;
        self
    }
}

pub trait Ranker: Send + Sync {
    fn rank(&self, input: &RankInput<'_>) -> i64;
}

/// 以 UNIX 时间戳作为优先级，截止时间越早越先出队
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadlineRanker;

impl Ranker for DeadlineRanker {
    fn rank(&self, input: &RankInput<'_>) -> i64 {
        input.deadline.timestamp()
    }
}

/// 结合历史运行记录与目标扫描强度
///
/// - 没有历史：[`FIRST_RUN_PRIORITY`]
/// - 最近一次尝试创建于宽限期内：[`INELIGIBLE`]
/// - 其他：越久没运行越优先，连续失败越靠后，扫描强度越高越优先
#[derive(Debug, Clone, Copy)]
pub struct HistoryRanker {
    grace_period: Duration,
}

impl HistoryRanker {
    pub fn new(grace_period: Duration) -> Self {
        Self { grace_period }
    }

    fn age_score(age: Duration) -> i64 {
        let horizon = Duration::days(AGE_HORIZON_DAYS).num_seconds() as f64;
        let ratio = (age.num_seconds().max(0) as f64 / horizon).min(1.0);
        (MAX_AGE_SCORE * (1.0 - ratio)).round() as i64
    }

    fn failure_penalty(prior_tasks: &[Task]) -> i64 {
        let consecutive = prior_tasks
            .iter()
            .take_while(|t| t.status == TaskStatus::Failed)
            .count() as i64;
        (consecutive * FAILURE_PENALTY).min(MAX_FAILURE_PENALTY)
    }
}

impl Ranker for HistoryRanker {
    fn rank(&self, input: &RankInput<'_>) -> i64 {
        let Some(latest) = input.prior_tasks.first() else {
            return FIRST_RUN_PRIORITY;
        };

        let age = input.now - latest.created_at;
        if age < self.grace_period {
            return INELIGIBLE;
        }

        let level = input.scan_level.unwrap_or(0).clamp(0, MAX_SCAN_LEVEL);
        let level_score = i64::from(MAX_SCAN_LEVEL - level);

        BASE_PRIORITY + Self::age_score(age) + Self::failure_penalty(input.prior_tasks) + level_score
    }
}
