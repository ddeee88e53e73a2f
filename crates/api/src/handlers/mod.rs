pub mod events;
pub mod health;
pub mod metrics;
pub mod queues;
pub mod schedulers;
pub mod schedules;
pub mod tasks;

use std::str::FromStr;

use scheduler_core::SchedulerError;

use crate::error::ApiResult;

/// 解析可选的查询参数，空字符串视为未提供
pub(crate) fn parse_optional<T>(value: Option<&str>) -> ApiResult<Option<T>>
where
    T: FromStr<Err = SchedulerError>,
{
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        Some(raw) => Ok(Some(raw.parse()?)),
        None => Ok(None),
    }
}
