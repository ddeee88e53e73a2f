//! 行映射的共享辅助函数
//!
//! SQLite 中时间戳以固定宽度的 UTC 文本保存，字典序即时间序；
//! UUID 与 JSON 同样以文本保存。

use chrono::{DateTime, NaiveDateTime, Utc};
use scheduler_core::{SchedulerError, SchedulerResult};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6fZ";

pub struct MappingHelpers;

impl MappingHelpers {
    pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
        ts.format(TIMESTAMP_FORMAT).to_string()
    }

    /// 接受本模块写出的格式以及任意 RFC 3339 文本
    pub fn parse_timestamp(value: &str) -> SchedulerResult<DateTime<Utc>> {
        if let Ok(naive) = NaiveDateTime::parse_from_str(value, TIMESTAMP_FORMAT) {
            return Ok(naive.and_utc());
        }
        DateTime::parse_from_rfc3339(value)
            .map(|ts| ts.with_timezone(&Utc))
            .map_err(|e| SchedulerError::Serialization(format!("解析时间戳失败 '{value}': {e}")))
    }

    pub fn get_timestamp(row: &SqliteRow, field: &str) -> SchedulerResult<DateTime<Utc>> {
        let raw: String = row.try_get(field)?;
        Self::parse_timestamp(&raw)
    }

    pub fn get_optional_timestamp(
        row: &SqliteRow,
        field: &str,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = row.try_get(field)?;
        raw.as_deref().map(Self::parse_timestamp).transpose()
    }

    pub fn get_uuid(row: &SqliteRow, field: &str) -> SchedulerResult<Uuid> {
        let raw: String = row.try_get(field)?;
        Uuid::parse_str(&raw)
            .map_err(|e| SchedulerError::Serialization(format!("解析{field}失败 '{raw}': {e}")))
    }

    pub fn get_optional_uuid(row: &SqliteRow, field: &str) -> SchedulerResult<Option<Uuid>> {
        let raw: Option<String> = row.try_get(field)?;
        raw.map(|value| {
            Uuid::parse_str(&value)
                .map_err(|e| SchedulerError::Serialization(format!("解析{field}失败 '{value}': {e}")))
        })
        .transpose()
    }

    pub fn get_json(row: &SqliteRow, field: &str) -> SchedulerResult<serde_json::Value> {
        let raw: String = row.try_get(field)?;
        serde_json::from_str(&raw)
            .map_err(|e| SchedulerError::Serialization(format!("解析{field}失败: {e}")))
    }

    pub fn get_optional_json(
        row: &SqliteRow,
        field: &str,
    ) -> SchedulerResult<Option<serde_json::Value>> {
        let raw: Option<String> = row.try_get(field)?;
        raw.map(|value| {
            serde_json::from_str(&value)
                .map_err(|e| SchedulerError::Serialization(format!("解析{field}失败: {e}")))
        })
        .transpose()
    }

    pub fn to_json_text(value: &serde_json::Value) -> SchedulerResult<String> {
        serde_json::to_string(value)
            .map_err(|e| SchedulerError::Serialization(format!("序列化JSON失败: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let early = Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let late = early + chrono::Duration::microseconds(1500);

        let a = MappingHelpers::format_timestamp(&early);
        let b = MappingHelpers::format_timestamp(&late);
        assert_eq!(a, "2024-01-02T03:04:05.000000Z");
        assert!(a < b);
        assert_eq!(MappingHelpers::parse_timestamp(&b).unwrap(), late);
    }

    #[test]
    fn test_parse_rfc3339_offsets() {
        let parsed = MappingHelpers::parse_timestamp("2024-01-02T05:04:05+02:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap());
        assert!(MappingHelpers::parse_timestamp("yesterday").is_err());
    }
}
