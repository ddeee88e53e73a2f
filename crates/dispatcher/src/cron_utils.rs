use chrono::{DateTime, Duration, Utc};
use cron::Schedule;
use std::str::FromStr;
use tracing::{debug, warn};

use scheduler_core::{SchedulerError, SchedulerResult};

/// CRON表达式解析和调度工具
///
/// 接受标准 5 段表达式（分 时 日 月 周），也接受带秒的 6/7 段表达式。
#[derive(Debug, Clone)]
pub struct CronScheduler {
    schedule: Schedule,
}

/// 5 段表达式补上秒字段
pub fn normalize_cron_expression(cron_expr: &str) -> String {
    let trimmed = cron_expr.trim();
    if trimmed.split_whitespace().count() == 5 {
        format!("0 {trimmed}")
    } else {
        trimmed.to_string()
    }
}

impl CronScheduler {
    pub fn new(cron_expr: &str) -> SchedulerResult<Self> {
        let normalized = normalize_cron_expression(cron_expr);
        let schedule = Schedule::from_str(&normalized).map_err(|e| SchedulerError::InvalidCron {
            expr: cron_expr.to_string(),
            message: e.to_string(),
        })?;

        Ok(Self { schedule })
    }

    /// 获取下一次执行时间
    pub fn next_execution_time(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.after(&from).next()
    }

    pub fn upcoming_times(&self, from: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        self.schedule.after(&from).take(count).collect()
    }

    pub fn validate_cron_expression(cron_expr: &str) -> SchedulerResult<()> {
        Self::new(cron_expr).map(|_| ())
    }
}

/// 周期任务的下一个截止时间
///
/// 优先级：cron 表达式 > 间隔 > 默认间隔。cron 无法给出下一次时间时退回到默认间隔。
pub fn calculate_deadline(
    cron_expr: Option<&str>,
    interval: Option<Duration>,
    default_interval: Duration,
    now: DateTime<Utc>,
) -> SchedulerResult<DateTime<Utc>> {
    if let Some(expr) = cron_expr.filter(|e| !e.trim().is_empty()) {
        let scheduler = CronScheduler::new(expr)?;
        if let Some(next) = scheduler.next_execution_time(now) {
            debug!("按cron表达式 {} 计算截止时间: {}", expr, next);
            return Ok(next);
        }
        warn!("cron表达式 {} 没有后续执行时间，使用默认间隔", expr);
        return Ok(now + default_interval);
    }

    match interval {
        Some(interval) if interval > Duration::zero() => Ok(now + interval),
        _ => Ok(now + default_interval),
    }
}
