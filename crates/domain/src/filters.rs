//! 查询过滤表达式
//!
//! 形如 `{"filters": [...]}` 或 `{"filters": {"and": [...], "or": [...], "not": [...]}}`，
//! `field` 用 `__` 分隔，指向 JSON 列内部的嵌套字段。

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum FilterOperator {
    #[default]
    #[serde(rename = "eq", alias = "==")]
    Eq,
    #[serde(rename = "ne", alias = "!=")]
    Ne,
    #[serde(rename = "gt", alias = ">")]
    Gt,
    #[serde(rename = "gte", alias = ">=")]
    Gte,
    #[serde(rename = "lt", alias = "<")]
    Lt,
    #[serde(rename = "lte", alias = "<=")]
    Lte,
    #[serde(rename = "is")]
    Is,
    #[serde(rename = "is_not")]
    IsNot,
    #[serde(rename = "is_null")]
    IsNull,
    #[serde(rename = "is_not_null")]
    IsNotNull,
    #[serde(rename = "like")]
    Like,
    #[serde(rename = "not_like")]
    NotLike,
    #[serde(rename = "ilike")]
    ILike,
    #[serde(rename = "not_ilike")]
    NotILike,
    #[serde(rename = "in")]
    In,
    #[serde(rename = "not_in")]
    NotIn,
    #[serde(rename = "contains")]
    Contains,
    #[serde(rename = "starts_with")]
    StartsWith,
}

impl FilterOperator {
    /// 不需要比较值的运算符
    pub fn is_unary(&self) -> bool {
        matches!(self, FilterOperator::IsNull | FilterOperator::IsNotNull)
    }

    pub fn expects_list(&self) -> bool {
        matches!(self, FilterOperator::In | FilterOperator::NotIn)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Filter {
    pub column: String,
    #[serde(default)]
    pub field: Option<String>,
    #[serde(default)]
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl Filter {
    pub fn new(column: &str, operator: FilterOperator, value: serde_json::Value) -> Self {
        Self {
            column: column.to_string(),
            field: None,
            operator,
            value,
        }
    }

    pub fn on_field(mut self, field: &str) -> Self {
        self.field = Some(field.to_string());
        self
    }

    pub fn field_path(&self) -> Vec<&str> {
        self.field
            .as_deref()
            .map(|f| f.split("__").filter(|p| !p.is_empty()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum FilterSet {
    /// 所有条件同时满足
    All(Vec<Filter>),
    Grouped(FilterGroups),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(deny_unknown_fields)]
pub struct FilterGroups {
    #[serde(default)]
    pub and: Vec<Filter>,
    #[serde(default)]
    pub or: Vec<Filter>,
    #[serde(default)]
    pub not: Vec<Filter>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilterRequest {
    pub filters: FilterSet,
}

impl FilterRequest {
    pub fn all(filters: Vec<Filter>) -> Self {
        Self {
            filters: FilterSet::All(filters),
        }
    }

    pub fn groups(&self) -> FilterGroups {
        match &self.filters {
            FilterSet::All(filters) => FilterGroups {
                and: filters.clone(),
                ..Default::default()
            },
            FilterSet::Grouped(groups) => groups.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        let groups = self.groups();
        groups.and.is_empty() && groups.or.is_empty() && groups.not.is_empty()
    }
}
