// Distinct-value lookups that populate filter dropdowns

use super::{FilterCondition, FilterService};
use async_trait::async_trait;
use lumen_core::sql::{escape_string, quote_identifier};
use lumen_core::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

/// Runs SQL produced by this crate against a live database.
///
/// Implemented by the caller; rows come back as column-name keyed maps.
#[async_trait]
pub trait QueryRunner: Send + Sync {
    async fn fetch_rows(&self, sql: &str) -> Result<Vec<Map<String, Value>>>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterOptionsRequest {
    pub column: String,
    pub table_name: String,
    #[serde(default)]
    pub schema_name: Option<String>,
    /// Case-insensitive substring the values must contain
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    /// Other active filters, so options cascade
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOptionValue {
    pub value: Value,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterOptions {
    pub column: String,
    pub values: Vec<FilterOptionValue>,
    pub total_count: u64,
    pub distinct_count: u64,
    pub null_count: u64,
    pub min_value: Value,
    pub max_value: Value,
}

impl FilterService {
    /// The three queries behind [`FilterService::get_filter_options`]:
    /// value histogram, counts, and min/max
    pub fn filter_option_queries(&self, request: &FilterOptionsRequest) -> Result<[String; 3]> {
        let col = self.quote(&request.column);
        let table = match &request.schema_name {
            Some(schema) => format!(
                "{}.{}",
                quote_identifier(self.dialect(), schema),
                quote_identifier(self.dialect(), &request.table_name)
            ),
            None => quote_identifier(self.dialect(), &request.table_name),
        };
        let limit = request.limit.unwrap_or(self.default_option_limit).max(1);

        let base_where = self.build_where_clause(&request.conditions, &[], &[])?;

        let mut histogram_where = base_where.clone();
        if let Some(search) = request.search.as_deref().filter(|s| !s.is_empty()) {
            let search_sql = format!(
                "LOWER(CAST({} AS {})) LIKE '%{}%'",
                col,
                self.dialect().text_type(),
                escape_string(&search.to_lowercase())
            );
            histogram_where = if histogram_where.is_empty() {
                search_sql
            } else {
                format!("{} AND {}", histogram_where, search_sql)
            };
        }

        let histogram = format!(
            "SELECT {col} AS value, COUNT(*) AS count FROM {table}{} GROUP BY {col} ORDER BY count DESC LIMIT {limit}",
            where_suffix(&histogram_where),
        );
        let counts = format!(
            "SELECT COUNT(*) AS total_count, COUNT(DISTINCT {col}) AS distinct_count, COUNT(*) - COUNT({col}) AS null_count FROM {table}{}",
            where_suffix(&base_where),
        );
        let range = format!(
            "SELECT MIN({col}) AS min_value, MAX({col}) AS max_value FROM {table}{}",
            where_suffix(&base_where),
        );

        Ok([histogram, counts, range])
    }

    /// Collect the values, counts and range of a column for a filter widget
    pub async fn get_filter_options(
        &self,
        runner: &dyn QueryRunner,
        request: &FilterOptionsRequest,
    ) -> Result<FilterOptions> {
        let [histogram_sql, counts_sql, range_sql] = self.filter_option_queries(request)?;
        let limit = request.limit.unwrap_or(self.default_option_limit).max(1);

        debug!(column = %request.column, table = %request.table_name, "Fetching filter options");

        let mut values: Vec<FilterOptionValue> = runner
            .fetch_rows(&histogram_sql)
            .await?
            .into_iter()
            .map(|mut row| FilterOptionValue {
                value: row.remove("value").unwrap_or(Value::Null),
                count: row.get("count").and_then(as_u64).unwrap_or(0),
            })
            .collect();
        values.sort_by(|a, b| b.count.cmp(&a.count));
        values.truncate(limit);

        let counts = first_row(runner.fetch_rows(&counts_sql).await?, "counts")?;
        let mut range = first_row(runner.fetch_rows(&range_sql).await?, "min/max")?;

        Ok(FilterOptions {
            column: request.column.clone(),
            values,
            total_count: counts.get("total_count").and_then(as_u64).unwrap_or(0),
            distinct_count: counts.get("distinct_count").and_then(as_u64).unwrap_or(0),
            null_count: counts.get("null_count").and_then(as_u64).unwrap_or(0),
            min_value: range.remove("min_value").unwrap_or(Value::Null),
            max_value: range.remove("max_value").unwrap_or(Value::Null),
        })
    }
}

fn where_suffix(clause: &str) -> String {
    if clause.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clause)
    }
}

fn first_row(rows: Vec<Map<String, Value>>, what: &str) -> Result<Map<String, Value>> {
    rows.into_iter()
        .next()
        .ok_or_else(|| Error::Executor(format!("{} query returned no rows", what)))
}

/// Drivers disagree on whether COUNT comes back as a number or a string
fn as_u64(value: &Value) -> Option<u64> {
    match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f.max(0.0) as u64)),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}
