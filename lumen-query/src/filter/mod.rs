//! Filter condition trees and their SQL compilation.
//!
//! A filter arrives from the dashboard as a tree of [`FilterGroup`]s whose
//! leaves are [`FilterCondition`]s, plus optional date filters. The
//! [`FilterService`] turns them into a WHERE clause for the configured
//! dialect and splices that clause into the chart's base query.

mod options;
mod statement;
mod translator;

pub use options::{FilterOptionValue, FilterOptions, FilterOptionsRequest, QueryRunner};
pub use statement::{inject_where_clause, SqlStatement};
pub use translator::FilterService;

use chrono::NaiveDate;
use lumen_core::Logic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    #[serde(alias = "eq", alias = "=")]
    Equals,
    #[serde(alias = "ne", alias = "neq", alias = "!=")]
    NotEquals,
    #[serde(alias = "gt", alias = ">")]
    GreaterThan,
    #[serde(alias = "gte", alias = ">=")]
    GreaterThanOrEqual,
    #[serde(alias = "lt", alias = "<")]
    LessThan,
    #[serde(alias = "lte", alias = "<=")]
    LessThanOrEqual,
    In,
    NotIn,
    Between,
    Like,
    NotLike,
    Contains,
    StartsWith,
    EndsWith,
    IsNull,
    IsNotNull,
    /// Anything the client sent that this compiler does not know
    #[serde(other)]
    Unsupported,
}

impl fmt::Display for FilterOperator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FilterOperator::Equals => "equals",
            FilterOperator::NotEquals => "not_equals",
            FilterOperator::GreaterThan => "greater_than",
            FilterOperator::GreaterThanOrEqual => "greater_than_or_equal",
            FilterOperator::LessThan => "less_than",
            FilterOperator::LessThanOrEqual => "less_than_or_equal",
            FilterOperator::In => "in",
            FilterOperator::NotIn => "not_in",
            FilterOperator::Between => "between",
            FilterOperator::Like => "like",
            FilterOperator::NotLike => "not_like",
            FilterOperator::Contains => "contains",
            FilterOperator::StartsWith => "starts_with",
            FilterOperator::EndsWith => "ends_with",
            FilterOperator::IsNull => "is_null",
            FilterOperator::IsNotNull => "is_not_null",
            FilterOperator::Unsupported => "unsupported",
        };
        write!(f, "{}", name)
    }
}

/// A single `column <op> value` predicate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterCondition {
    pub column: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
    /// Upper bound for BETWEEN
    #[serde(default)]
    pub value2: Option<Value>,
}

impl FilterCondition {
    pub fn new(column: impl Into<String>, operator: FilterOperator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
            value2: None,
        }
    }

    pub fn between(column: impl Into<String>, low: Value, high: Value) -> Self {
        Self {
            column: column.into(),
            operator: FilterOperator::Between,
            value: low,
            value2: Some(high),
        }
    }
}

/// Child of a [`FilterGroup`]: either a leaf condition or a nested group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FilterNode {
    Group(FilterGroup),
    Condition(FilterCondition),
}

impl From<FilterCondition> for FilterNode {
    fn from(condition: FilterCondition) -> Self {
        FilterNode::Condition(condition)
    }
}

impl From<FilterGroup> for FilterNode {
    fn from(group: FilterGroup) -> Self {
        FilterNode::Group(group)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterGroup {
    #[serde(default)]
    pub logic: Logic,
    pub conditions: Vec<FilterNode>,
}

impl FilterGroup {
    pub fn and(conditions: Vec<FilterNode>) -> Self {
        Self { logic: Logic::And, conditions }
    }

    pub fn or(conditions: Vec<FilterNode>) -> Self {
        Self { logic: Logic::Or, conditions }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DateUnit {
    #[serde(alias = "days")]
    Day,
    #[serde(alias = "weeks")]
    Week,
    #[serde(alias = "months")]
    Month,
    #[serde(alias = "quarters")]
    Quarter,
    #[serde(alias = "years")]
    Year,
}

fn default_true() -> bool {
    true
}

/// "Last N units" relative to the evaluation time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelativeDateFilter {
    pub column: String,
    pub value: u32,
    pub unit: DateUnit,
    #[serde(default = "default_true")]
    pub include_current: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DateRangeFilter {
    pub column: String,
    #[serde(default)]
    pub start_date: Option<NaiveDate>,
    #[serde(default)]
    pub end_date: Option<NaiveDate>,
    #[serde(default = "default_true")]
    pub include_start: bool,
    #[serde(default = "default_true")]
    pub include_end: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DateFilter {
    Relative(RelativeDateFilter),
    Range(DateRangeFilter),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operator_deserialize_aliases() {
        let op: FilterOperator = serde_json::from_value(json!("gte")).unwrap();
        assert_eq!(op, FilterOperator::GreaterThanOrEqual);
        let op: FilterOperator = serde_json::from_value(json!("starts_with")).unwrap();
        assert_eq!(op, FilterOperator::StartsWith);
    }

    #[test]
    fn test_unknown_operator_is_unsupported() {
        let op: FilterOperator = serde_json::from_value(json!("regex_match")).unwrap();
        assert_eq!(op, FilterOperator::Unsupported);
    }

    #[test]
    fn test_nested_group_deserialize() {
        let group: FilterGroup = serde_json::from_value(json!({
            "logic": "or",
            "conditions": [
                {"column": "region", "operator": "equals", "value": "EU"},
                {"logic": "and", "conditions": [
                    {"column": "amount", "operator": "gt", "value": 10}
                ]}
            ]
        }))
        .unwrap();

        assert_eq!(group.logic, Logic::Or);
        assert!(matches!(group.conditions[0], FilterNode::Condition(_)));
        assert!(matches!(group.conditions[1], FilterNode::Group(_)));
    }

    #[test]
    fn test_date_filter_untagged() {
        let relative: DateFilter = serde_json::from_value(json!({
            "column": "created_at", "value": 7, "unit": "day"
        }))
        .unwrap();
        assert!(matches!(relative, DateFilter::Relative(ref f) if f.include_current));

        let range: DateFilter = serde_json::from_value(json!({
            "column": "created_at", "start_date": "2024-01-01"
        }))
        .unwrap();
        assert!(matches!(range, DateFilter::Range(ref f) if f.end_date.is_none()));
    }
}
