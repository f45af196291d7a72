// SQL text helpers shared by every SQL-emitting compiler

use crate::types::SqlDialect;
use serde_json::Value;

/// Double single quotes so the text is safe inside a SQL string literal
pub fn escape_string(value: &str) -> String {
    value.replace('\'', "''")
}

/// Quote an identifier for the dialect.
///
/// Dotted names (`schema.table.column`) are quoted part by part. Embedded
/// quote characters are doubled. `*` is passed through unquoted.
pub fn quote_identifier(dialect: SqlDialect, name: &str) -> String {
    let quote = dialect.identifier_quote();
    name.split('.')
        .map(|part| {
            if part == "*" {
                return part.to_string();
            }
            let doubled = part.replace(quote, &format!("{quote}{quote}"));
            format!("{quote}{doubled}{quote}")
        })
        .collect::<Vec<_>>()
        .join(".")
}

/// Plain text form of a JSON value, without SQL quoting
pub fn value_as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Render a JSON value as a SQL literal
pub fn format_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_string(),
        Value::Bool(true) => "TRUE".to_string(),
        Value::Bool(false) => "FALSE".to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => format!("'{}'", escape_string(s)),
        // Structured values are compared as their JSON text
        Value::Array(_) | Value::Object(_) => format!("'{}'", escape_string(&value.to_string())),
    }
}

/// Render a comma separated literal list, as used inside `IN (...)`
pub fn format_literal_list(values: &[Value]) -> String {
    values.iter().map(format_literal).collect::<Vec<_>>().join(", ")
}

/// Build a quoted LIKE pattern with optional leading/trailing `%`
pub fn like_pattern(value: &Value, leading: bool, trailing: bool) -> String {
    let text = escape_string(&value_as_text(value));
    format!(
        "'{}{}{}'",
        if leading { "%" } else { "" },
        text,
        if trailing { "%" } else { "" }
    )
}

/// LIKE pattern whose `%` and `_` match literally, using `!` as the escape
///
/// For values the policy author did not write, e.g. user attributes.
pub fn literal_like_pattern(value: &Value, leading: bool, trailing: bool) -> String {
    let text = value_as_text(value)
        .replace('!', "!!")
        .replace('%', "!%")
        .replace('_', "!_");
    format!(
        "'{}{}{}' ESCAPE '!'",
        if leading { "%" } else { "" },
        escape_string(&text),
        if trailing { "%" } else { "" }
    )
}

/// Treat a scalar as a single-element list
pub fn as_list(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}
