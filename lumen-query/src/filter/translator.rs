use super::{
    statement, DateFilter, DateRangeFilter, DateUnit, FilterCondition, FilterGroup, FilterNode,
    FilterOperator, RelativeDateFilter,
};
use chrono::{DateTime, Duration, Months, NaiveDate, Utc};
use lumen_core::sql::{as_list, format_literal, format_literal_list, like_pattern, quote_identifier};
use lumen_core::{Error, FilterConfig, Result, SqlDialect};
use serde_json::Value;
use tracing::{debug, warn};

/// Compiles filter conditions into SQL WHERE clauses
#[derive(Debug, Clone)]
pub struct FilterService {
    dialect: SqlDialect,
    strict: bool,
    pub(crate) default_option_limit: usize,
}

impl Default for FilterService {
    fn default() -> Self {
        Self::from_config(&FilterConfig::default())
    }
}

impl FilterService {
    pub fn new(dialect: SqlDialect) -> Self {
        Self {
            dialect,
            ..Self::default()
        }
    }

    pub fn from_config(config: &FilterConfig) -> Self {
        Self {
            dialect: config.dialect(),
            strict: config.strict_operators,
            default_option_limit: config.default_option_limit,
        }
    }

    /// Propagate unsupported operators and missing values instead of dropping them
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn dialect(&self) -> SqlDialect {
        self.dialect
    }

    pub(crate) fn quote(&self, column: &str) -> String {
        quote_identifier(self.dialect, column)
    }

    /// Compile a single condition
    pub fn build_condition(&self, condition: &FilterCondition) -> Result<String> {
        let col = self.quote(&condition.column);
        let value = &condition.value;

        let sql = match condition.operator {
            FilterOperator::Equals => {
                if value.is_null() {
                    format!("{} IS NULL", col)
                } else {
                    format!("{} = {}", col, format_literal(value))
                }
            }
            FilterOperator::NotEquals => {
                if value.is_null() {
                    format!("{} IS NOT NULL", col)
                } else {
                    format!("{} != {}", col, format_literal(value))
                }
            }
            FilterOperator::GreaterThan => {
                format!("{} > {}", col, format_literal(required(condition, value)?))
            }
            FilterOperator::GreaterThanOrEqual => {
                format!("{} >= {}", col, format_literal(required(condition, value)?))
            }
            FilterOperator::LessThan => {
                format!("{} < {}", col, format_literal(required(condition, value)?))
            }
            FilterOperator::LessThanOrEqual => {
                format!("{} <= {}", col, format_literal(required(condition, value)?))
            }
            FilterOperator::In => {
                let values = as_list(required(condition, value)?);
                if values.is_empty() {
                    // Nothing can match an empty set
                    "1=0".to_string()
                } else {
                    format!("{} IN ({})", col, format_literal_list(&values))
                }
            }
            FilterOperator::NotIn => {
                let values = as_list(required(condition, value)?);
                if values.is_empty() {
                    "1=1".to_string()
                } else {
                    format!("{} NOT IN ({})", col, format_literal_list(&values))
                }
            }
            FilterOperator::Between => {
                let low = required(condition, value)?;
                let high = condition
                    .value2
                    .as_ref()
                    .filter(|v| !v.is_null())
                    .ok_or_else(|| Error::MissingValue {
                        column: condition.column.clone(),
                        reason: "between requires value2".to_string(),
                    })?;
                format!(
                    "{} BETWEEN {} AND {}",
                    col,
                    format_literal(low),
                    format_literal(high)
                )
            }
            FilterOperator::Like | FilterOperator::Contains => {
                format!("{} LIKE {}", col, like_pattern(required(condition, value)?, true, true))
            }
            FilterOperator::NotLike => {
                format!(
                    "{} NOT LIKE {}",
                    col,
                    like_pattern(required(condition, value)?, true, true)
                )
            }
            FilterOperator::StartsWith => {
                format!("{} LIKE {}", col, like_pattern(required(condition, value)?, false, true))
            }
            FilterOperator::EndsWith => {
                format!("{} LIKE {}", col, like_pattern(required(condition, value)?, true, false))
            }
            FilterOperator::IsNull => format!("{} IS NULL", col),
            FilterOperator::IsNotNull => format!("{} IS NOT NULL", col),
            FilterOperator::Unsupported => {
                return Err(Error::UnsupportedOperator {
                    column: condition.column.clone(),
                    operator: condition.operator.to_string(),
                });
            }
        };

        Ok(sql)
    }

    /// Compile a relative date filter against the current time
    pub fn build_relative_date_condition(&self, filter: &RelativeDateFilter) -> Result<String> {
        self.build_relative_date_condition_at(filter, Utc::now())
    }

    /// Compile a relative date filter against a fixed evaluation time
    pub fn build_relative_date_condition_at(
        &self,
        filter: &RelativeDateFilter,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let start = relative_start(now, filter.value, filter.unit)?;
        let end = if filter.include_current {
            now
        } else {
            now.checked_sub_signed(Duration::days(1))
                .ok_or_else(|| Error::InvalidDate("end date out of range".to_string()))?
        };

        let col = self.quote(&filter.column);
        Ok(format!(
            "{} >= '{}' AND {} <= '{}'",
            col,
            format_date(start.date_naive()),
            col,
            format_date(end.date_naive())
        ))
    }

    /// Compile an absolute date range; `None` when neither bound is set
    pub fn build_date_range_condition(&self, filter: &DateRangeFilter) -> Option<String> {
        let col = self.quote(&filter.column);
        let mut parts = Vec::new();

        if let Some(start) = filter.start_date {
            let op = if filter.include_start { ">=" } else { ">" };
            parts.push(format!("{} {} '{}'", col, op, format_date(start)));
        }
        if let Some(end) = filter.end_date {
            let op = if filter.include_end { "<=" } else { "<" };
            parts.push(format!("{} {} '{}'", col, op, format_date(end)));
        }

        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" AND "))
        }
    }

    pub fn build_date_condition(&self, filter: &DateFilter) -> Result<Option<String>> {
        match filter {
            DateFilter::Relative(relative) => self.build_relative_date_condition(relative).map(Some),
            DateFilter::Range(range) => Ok(self.build_date_range_condition(range)),
        }
    }

    /// Compile a (possibly nested) group of conditions
    pub fn build_filter_group(&self, group: &FilterGroup) -> Result<String> {
        let mut parts = Vec::with_capacity(group.conditions.len());

        for node in &group.conditions {
            match node {
                FilterNode::Condition(condition) => {
                    if let Some(sql) = self.degrade(self.build_condition(condition))? {
                        parts.push(sql);
                    }
                }
                FilterNode::Group(nested) => {
                    let sql = self.build_filter_group(nested)?;
                    if !sql.is_empty() {
                        parts.push(format!("({})", sql));
                    }
                }
            }
        }

        Ok(parts.join(group.logic.sql_separator()))
    }

    /// Combine standalone conditions, date filters and groups with AND
    pub fn build_where_clause(
        &self,
        conditions: &[FilterCondition],
        date_filters: &[DateFilter],
        groups: &[FilterGroup],
    ) -> Result<String> {
        let mut fragments = Vec::new();

        for condition in conditions {
            if let Some(sql) = self.degrade(self.build_condition(condition))? {
                fragments.push(sql);
            }
        }

        for date_filter in date_filters {
            if let Some(sql) = self.build_date_condition(date_filter)? {
                fragments.push(sql);
            }
        }

        for group in groups {
            let sql = self.build_filter_group(group)?;
            if !sql.is_empty() {
                fragments.push(format!("({})", sql));
            }
        }

        let clause = fragments.join(" AND ");
        debug!(fragments = fragments.len(), "Built where clause");
        Ok(clause)
    }

    /// Splice a compiled clause into a query, parsed with this service's dialect.
    /// See [`statement::inject_where_clause`].
    pub fn inject_where_clause(&self, sql: &str, where_clause: &str) -> String {
        statement::inject_with(Some(self.dialect), sql, where_clause)
    }

    /// Drop conditions the compiler cannot express, unless running strict
    fn degrade(&self, result: Result<String>) -> Result<Option<String>> {
        match result {
            Ok(sql) if sql.is_empty() => Ok(None),
            Ok(sql) => Ok(Some(sql)),
            Err(err @ (Error::UnsupportedOperator { .. } | Error::MissingValue { .. }))
                if !self.strict =>
            {
                // A dropped filter widens the result set, so make it visible
                warn!(error = %err, "Dropping filter condition");
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }
}

fn required<'a>(condition: &FilterCondition, value: &'a Value) -> Result<&'a Value> {
    if value.is_null() {
        Err(Error::MissingValue {
            column: condition.column.clone(),
            reason: format!("{} requires a value", condition.operator),
        })
    } else {
        Ok(value)
    }
}

fn relative_start(now: DateTime<Utc>, value: u32, unit: DateUnit) -> Result<DateTime<Utc>> {
    let out_of_range = || Error::InvalidDate(format!("{} {:?} before {} is out of range", value, unit, now));

    match unit {
        DateUnit::Day => Duration::try_days(value as i64)
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or_else(out_of_range),
        DateUnit::Week => Duration::try_weeks(value as i64)
            .and_then(|d| now.checked_sub_signed(d))
            .ok_or_else(out_of_range),
        DateUnit::Month => now.checked_sub_months(Months::new(value)).ok_or_else(out_of_range),
        DateUnit::Quarter => value
            .checked_mul(3)
            .and_then(|m| now.checked_sub_months(Months::new(m)))
            .ok_or_else(out_of_range),
        DateUnit::Year => value
            .checked_mul(12)
            .and_then(|m| now.checked_sub_months(Months::new(m)))
            .ok_or_else(out_of_range),
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}
