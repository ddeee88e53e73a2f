//! 过滤表达式到 SQL 的编译
//!
//! 所有值都通过参数绑定传入；列名只能来自各表的白名单，
//! JSON 列内的字段路径经校验后同样作为参数绑定给 `json_extract`。

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::filters::{Filter, FilterOperator, FilterRequest};
use serde_json::Value;
use sqlx::{QueryBuilder, Sqlite};

use super::mapping::MappingHelpers;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Json,
    Integer,
    Real,
    Timestamp,
    Boolean,
}

pub type ColumnSpec = (&'static str, ColumnKind);

pub const TASK_COLUMNS: &[ColumnSpec] = &[
    ("id", ColumnKind::Text),
    ("scheduler_id", ColumnKind::Text),
    ("organisation", ColumnKind::Text),
    ("task_type", ColumnKind::Text),
    ("hash", ColumnKind::Text),
    ("priority", ColumnKind::Integer),
    ("status", ColumnKind::Text),
    ("data", ColumnKind::Json),
    ("meta", ColumnKind::Json),
    ("deduplication_key", ColumnKind::Text),
    ("pending", ColumnKind::Real),
    ("queued", ColumnKind::Real),
    ("dispatched", ColumnKind::Real),
    ("running", ColumnKind::Real),
    ("created_at", ColumnKind::Timestamp),
    ("modified_at", ColumnKind::Timestamp),
];

pub const SCHEDULE_COLUMNS: &[ColumnSpec] = &[
    ("id", ColumnKind::Text),
    ("scheduler_id", ColumnKind::Text),
    ("organisation", ColumnKind::Text),
    ("hash", ColumnKind::Text),
    ("data", ColumnKind::Json),
    ("schedule", ColumnKind::Text),
    ("interval_seconds", ColumnKind::Integer),
    ("enabled", ColumnKind::Boolean),
    ("deadline_at", ColumnKind::Timestamp),
    ("created_at", ColumnKind::Timestamp),
    ("modified_at", ColumnKind::Timestamp),
];

pub const QUEUE_COLUMNS: &[ColumnSpec] = &[
    ("id", ColumnKind::Text),
    ("hash", ColumnKind::Text),
    ("priority", ColumnKind::Integer),
    ("data", ColumnKind::Json),
    ("created_at", ColumnKind::Timestamp),
    ("modified_at", ColumnKind::Timestamp),
];

/// 绑定到查询中的标量值
#[derive(Debug, Clone, PartialEq)]
enum SqlValue {
    Null,
    Text(String),
    Integer(i64),
    Real(f64),
}

fn invalid(message: impl Into<String>) -> SchedulerError {
    SchedulerError::Storage(format!("无效的过滤条件: {}", message.into()))
}

/// 把过滤表达式以 ` AND ...` 的形式追加到已有 WHERE 子句之后
///
/// `and` 组全部满足，`or` 组至少满足一个，`not` 组中任何一个都不满足。
pub fn push_filters(
    builder: &mut QueryBuilder<'_, Sqlite>,
    request: &FilterRequest,
    columns: &[ColumnSpec],
) -> SchedulerResult<()> {
    let groups = request.groups();

    if !groups.and.is_empty() {
        builder.push(" AND (");
        push_joined(builder, &groups.and, " AND ", columns)?;
        builder.push(")");
    }

    if !groups.or.is_empty() {
        builder.push(" AND (");
        push_joined(builder, &groups.or, " OR ", columns)?;
        builder.push(")");
    }

    for filter in &groups.not {
        builder.push(" AND NOT (");
        push_filter(builder, filter, columns)?;
        builder.push(")");
    }

    Ok(())
}

fn push_joined(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filters: &[Filter],
    separator: &str,
    columns: &[ColumnSpec],
) -> SchedulerResult<()> {
    for (i, filter) in filters.iter().enumerate() {
        if i > 0 {
            builder.push(separator);
        }
        builder.push("(");
        push_filter(builder, filter, columns)?;
        builder.push(")");
    }
    Ok(())
}

fn lookup_column(column: &str, columns: &[ColumnSpec]) -> SchedulerResult<ColumnKind> {
    columns
        .iter()
        .find(|(name, _)| *name == column)
        .map(|(_, kind)| *kind)
        .ok_or_else(|| invalid(format!("不支持的列 '{column}'")))
}

fn json_path(filter: &Filter) -> SchedulerResult<Option<String>> {
    let parts = filter.field_path();
    if parts.is_empty() {
        return Ok(None);
    }

    for part in &parts {
        if !part.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid(format!("非法的字段名 '{part}'")));
        }
    }
    Ok(Some(format!("$.{}", parts.join("."))))
}

/// 写出被比较的表达式，返回比较时使用的值类型
fn push_target(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filter: &Filter,
    columns: &[ColumnSpec],
) -> SchedulerResult<ColumnKind> {
    let kind = lookup_column(&filter.column, columns)?;
    let path = json_path(filter)?;

    match (kind, path) {
        (ColumnKind::Json, Some(path)) => {
            builder.push("json_extract(");
            builder.push(filter.column.as_str());
            builder.push(", ");
            builder.push_bind(path);
            builder.push(")");
            Ok(ColumnKind::Json)
        }
        (ColumnKind::Json, None) if !filter.operator.is_unary() => Err(invalid(format!(
            "JSON列 '{}' 需要指定 field",
            filter.column
        ))),
        (_, Some(_)) => Err(invalid(format!(
            "列 '{}' 不支持嵌套字段",
            filter.column
        ))),
        _ => {
            builder.push(filter.column.as_str());
            Ok(kind)
        }
    }
}

fn convert_value(value: &Value, kind: ColumnKind) -> SchedulerResult<SqlValue> {
    match (kind, value) {
        (_, Value::Null) => Ok(SqlValue::Null),
        (ColumnKind::Text, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (ColumnKind::Text, Value::Number(n)) => Ok(SqlValue::Text(n.to_string())),
        (ColumnKind::Text, Value::Bool(b)) => Ok(SqlValue::Text(b.to_string())),
        (ColumnKind::Integer | ColumnKind::Real | ColumnKind::Json, Value::Number(n)) => {
            match n.as_i64() {
                Some(i) => Ok(SqlValue::Integer(i)),
                None => n
                    .as_f64()
                    .map(SqlValue::Real)
                    .ok_or_else(|| invalid(format!("无法表示的数值 {n}"))),
            }
        }
        (ColumnKind::Integer, Value::String(s)) => s
            .parse::<i64>()
            .map(SqlValue::Integer)
            .map_err(|_| invalid(format!("'{s}' 不是整数"))),
        (ColumnKind::Real, Value::String(s)) => s
            .parse::<f64>()
            .map(SqlValue::Real)
            .map_err(|_| invalid(format!("'{s}' 不是数值"))),
        (ColumnKind::Timestamp, Value::String(s)) => {
            let ts = MappingHelpers::parse_timestamp(s).map_err(|_| invalid(format!("'{s}' 不是时间戳")))?;
            Ok(SqlValue::Text(MappingHelpers::format_timestamp(&ts)))
        }
        (ColumnKind::Boolean | ColumnKind::Json, Value::Bool(b)) => {
            Ok(SqlValue::Integer(i64::from(*b)))
        }
        (ColumnKind::Json, Value::String(s)) => Ok(SqlValue::Text(s.clone())),
        (_, other) => Err(invalid(format!("值 {other} 与列类型不匹配"))),
    }
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: SqlValue) {
    match value {
        SqlValue::Null => {
            builder.push("NULL");
        }
        SqlValue::Text(s) => {
            builder.push_bind(s);
        }
        SqlValue::Integer(i) => {
            builder.push_bind(i);
        }
        SqlValue::Real(f) => {
            builder.push_bind(f);
        }
    }
}

fn text_value(value: &Value) -> SchedulerResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| invalid(format!("需要字符串值，得到 {value}")))
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

fn push_filter(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filter: &Filter,
    columns: &[ColumnSpec],
) -> SchedulerResult<()> {
    use FilterOperator::*;

    if filter.operator == Contains {
        return push_contains(builder, filter, columns);
    }

    // ilike 需要先写 LOWER(
    if matches!(filter.operator, ILike | NotILike) {
        builder.push("LOWER(");
    }
    let kind = push_target(builder, filter, columns)?;

    match filter.operator {
        IsNull => {
            builder.push(" IS NULL");
        }
        IsNotNull => {
            builder.push(" IS NOT NULL");
        }
        Eq | Ne | Is | IsNot => {
            let value = convert_value(&filter.value, kind)?;
            let op = match (filter.operator, &value) {
                (Eq | Is, SqlValue::Null) => " IS ",
                (Ne | IsNot, SqlValue::Null) => " IS NOT ",
                (Eq, _) => " = ",
                (Ne, _) => " != ",
                (Is, _) => " IS ",
                _ => " IS NOT ",
            };
            builder.push(op);
            push_value(builder, value);
        }
        Gt | Gte | Lt | Lte => {
            let value = convert_value(&filter.value, kind)?;
            if value == SqlValue::Null {
                return Err(invalid(format!("列 '{}' 的比较值不能为空", filter.column)));
            }
            builder.push(match filter.operator {
                Gt => " > ",
                Gte => " >= ",
                Lt => " < ",
                _ => " <= ",
            });
            push_value(builder, value);
        }
        Like | NotLike => {
            builder.push(if filter.operator == Like {
                " LIKE "
            } else {
                " NOT LIKE "
            });
            builder.push_bind(text_value(&filter.value)?);
        }
        ILike | NotILike => {
            builder.push(if filter.operator == ILike {
                ") LIKE LOWER("
            } else {
                ") NOT LIKE LOWER("
            });
            builder.push_bind(text_value(&filter.value)?);
            builder.push(")");
        }
        In | NotIn => {
            let values = filter
                .value
                .as_array()
                .ok_or_else(|| invalid(format!("'{}' 需要数组值", filter.column)))?;
            if values.is_empty() {
                // 空集合：IN 恒假，NOT IN 恒真
                builder.push(if filter.operator == In {
                    " IS NULL AND 1 = 0"
                } else {
                    " IS NULL OR 1 = 1"
                });
                return Ok(());
            }
            let converted = values
                .iter()
                .map(|v| convert_value(v, kind))
                .collect::<SchedulerResult<Vec<_>>>()?;
            builder.push(if filter.operator == In {
                " IN ("
            } else {
                " NOT IN ("
            });
            for (i, value) in converted.into_iter().enumerate() {
                if i > 0 {
                    builder.push(", ");
                }
                push_value(builder, value);
            }
            builder.push(")");
        }
        StartsWith => {
            if !matches!(kind, ColumnKind::Text | ColumnKind::Json) {
                return Err(invalid(format!("列 '{}' 不支持 starts_with", filter.column)));
            }
            builder.push(" LIKE ");
            builder.push_bind(format!("{}%", escape_like(&text_value(&filter.value)?)));
            builder.push(" ESCAPE '\\'");
        }
        // 已在函数开头处理
        Contains => {}
    }

    Ok(())
}

/// JSON 数组包含某值，或文本列包含子串
fn push_contains(
    builder: &mut QueryBuilder<'_, Sqlite>,
    filter: &Filter,
    columns: &[ColumnSpec],
) -> SchedulerResult<()> {
    match lookup_column(&filter.column, columns)? {
        ColumnKind::Json => {
            let path = json_path(filter)?.unwrap_or_else(|| "$".to_string());
            let value = convert_value(&filter.value, ColumnKind::Json)?;
            builder.push("EXISTS (SELECT 1 FROM json_each(");
            builder.push(filter.column.as_str());
            builder.push(", ");
            builder.push_bind(path);
            builder.push(") WHERE json_each.value = ");
            push_value(builder, value);
            builder.push(")");
        }
        ColumnKind::Text => {
            if filter.field.is_some() {
                return Err(invalid(format!("列 '{}' 不支持嵌套字段", filter.column)));
            }
            builder.push("instr(");
            builder.push(filter.column.as_str());
            builder.push(", ");
            builder.push_bind(text_value(&filter.value)?);
            builder.push(") > 0");
        }
        _ => {
            return Err(invalid(format!("列 '{}' 不支持 contains", filter.column)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn compile(request: serde_json::Value) -> SchedulerResult<String> {
        let request: FilterRequest = serde_json::from_value(request).unwrap();
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT * FROM tasks WHERE 1 = 1");
        push_filters(&mut builder, &request, TASK_COLUMNS)?;
        Ok(builder.sql().to_string())
    }

    #[test]
    fn test_nested_field_uses_bound_json_path() {
        let sql = compile(json!({
            "filters": [{"column": "data", "field": "plugin__id", "value": "dns"}]
        }))
        .unwrap();
        assert_eq!(
            sql,
            "SELECT * FROM tasks WHERE 1 = 1 AND ((json_extract(data, ?) = ?))"
        );
    }

    #[test]
    fn test_groups_compile_to_and_or_not() {
        let sql = compile(json!({
            "filters": {
                "and": [{"column": "priority", "operator": ">=", "value": 2}],
                "or": [
                    {"column": "status", "value": "queued"},
                    {"column": "status", "value": "dispatched"}
                ],
                "not": [{"column": "hash", "operator": "in", "value": ["a", "b"]}]
            }
        }))
        .unwrap();
        assert!(sql.contains("AND ((priority >= ?))"));
        assert!(sql.contains("AND ((status = ?) OR (status = ?))"));
        assert!(sql.ends_with("AND NOT (hash IN (?, ?))"));
    }

    #[test]
    fn test_null_comparisons_and_empty_lists() {
        let sql = compile(json!({
            "filters": [
                {"column": "meta", "field": "origin", "operator": "eq", "value": null},
                {"column": "hash", "operator": "in", "value": []}
            ]
        }))
        .unwrap();
        assert!(sql.contains("json_extract(meta, ?) IS NULL"));
        assert!(sql.contains("hash IS NULL AND 1 = 0"));
    }

    #[test]
    fn test_text_helpers() {
        let sql = compile(json!({
            "filters": [
                {"column": "hash", "operator": "starts_with", "value": "ab_"},
                {"column": "organisation", "operator": "ilike", "value": "%ORG%"},
                {"column": "data", "field": "artifact__content_type_tags", "operator": "contains", "value": "text/html"}
            ]
        }))
        .unwrap();
        assert!(sql.contains("hash LIKE ? ESCAPE '\\'"));
        assert!(sql.contains("LOWER(organisation) LIKE LOWER(?)"));
        assert!(sql.contains("EXISTS (SELECT 1 FROM json_each(data, ?) WHERE json_each.value = ?)"));
        assert_eq!(escape_like("ab_%"), "ab\\_\\%");
    }

    #[test]
    fn test_rejects_unknown_columns_and_bad_values() {
        let err = compile(json!({"filters": [{"column": "password", "value": "x"}]})).unwrap_err();
        assert!(err.is_storage());

        let err = compile(json!({
            "filters": [{"column": "priority", "operator": "gt", "value": "soon"}]
        }))
        .unwrap_err();
        assert!(err.is_storage());

        let err = compile(json!({
            "filters": [{"column": "data", "field": "a; DROP", "value": 1}]
        }))
        .unwrap_err();
        assert!(err.is_storage());

        let err = compile(json!({"filters": [{"column": "data", "value": "x"}]})).unwrap_err();
        assert!(err.is_storage());

        let err = compile(json!({
            "filters": [{"column": "created_at", "operator": "lt", "value": "not-a-date"}]
        }))
        .unwrap_err();
        assert!(err.is_storage());
    }
}
