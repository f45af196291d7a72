// Column expressions to MongoDB aggregation expressions

use serde_json::{Map, Number, Value};

const OPERATORS: [(char, &str); 4] = [
    ('+', "$add"),
    ('-', "$subtract"),
    ('*', "$multiply"),
    ('/', "$divide"),
];

/// Parse a column expression such as `price * quantity`.
///
/// Understands `$field` references, quoted string literals, numbers, and
/// one binary operator per level. Operators are tried in the order
/// `+ - * /` and the expression is split at the first occurrence, with both
/// sides parsed recursively. So `a * b + c` groups as `(a * b) + c`, while
/// `a - b - c` groups as `a - (b - c)`. Bare identifiers and anything else
/// unrecognised become field references.
pub fn parse_expression(expression: &str) -> Value {
    let expr = expression.trim();
    if expr.is_empty() {
        return Value::Null;
    }

    if let Some(name) = expr.strip_prefix('$') {
        if is_identifier(name) {
            return Value::String(expr.to_string());
        }
    }

    if let Some(text) = unquote(expr) {
        // A string starting with `$` would otherwise be read as a field path
        return if text.starts_with('$') {
            single("$literal", Value::String(text.to_string()))
        } else {
            Value::String(text.to_string())
        };
    }

    if let Some(number) = parse_number(expr) {
        return number;
    }

    for (op, name) in OPERATORS {
        if let Some(index) = expr.find(op) {
            let left = expr[..index].trim();
            let right = expr[index + op.len_utf8()..].trim();
            if !left.is_empty() && !right.is_empty() {
                return single(
                    name,
                    Value::Array(vec![parse_expression(left), parse_expression(right)]),
                );
            }
        }
    }

    field_ref(expr)
}

/// `$toX` conversion operator for a cast target type
pub fn cast_operator(target: &str) -> Option<&'static str> {
    let op = match target.trim().to_ascii_lowercase().as_str() {
        "string" | "str" | "text" | "varchar" => "$toString",
        "int" | "integer" | "int32" => "$toInt",
        "long" | "int64" | "bigint" => "$toLong",
        "double" | "float" | "number" | "decimal" => "$toDouble",
        "bool" | "boolean" => "$toBool",
        "date" | "datetime" | "timestamp" => "$toDate",
        "objectid" | "object_id" => "$toObjectId",
        _ => return None,
    };
    Some(op)
}

pub(crate) fn field_ref(column: &str) -> Value {
    Value::String(format!("${}", column))
}

/// Single-key document, the shape of every stage and operator
pub(crate) fn single(key: &str, value: Value) -> Value {
    let mut map = Map::with_capacity(1);
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn is_identifier(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
}

fn unquote(expr: &str) -> Option<&str> {
    let quote = expr.chars().next().filter(|c| *c == '\'' || *c == '"')?;
    let inner = expr.strip_prefix(quote)?.strip_suffix(quote)?;
    (!inner.contains(quote)).then_some(inner)
}

fn parse_number(expr: &str) -> Option<Value> {
    if let Ok(int) = expr.parse::<i64>() {
        return Some(Value::Number(int.into()));
    }
    // Rules out words like `nan` and `inf` that `f64` would accept
    if !expr.starts_with(|c: char| c.is_ascii_digit() || c == '-' || c == '.') {
        return None;
    }
    expr.parse::<f64>()
        .ok()
        .and_then(Number::from_f64)
        .map(Value::Number)
}
