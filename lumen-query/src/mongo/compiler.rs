use super::expr::{cast_operator, field_ref, parse_expression, single};
use super::pattern::{like_to_regex, literal_regex};
use super::{
    AggFn, Aggregation, CompileOptions, MatchCondition, MatchOperator, SortKey, TextCase,
    TransformStep, TrimSide,
};
use lumen_core::sql::as_list;
use lumen_core::{Error, Logic, PipelineOrdering, Result, TransformConfig};
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Compiles transform recipes into aggregation pipelines
#[derive(Debug, Clone, Default)]
pub struct MongoTransformService {
    config: TransformConfig,
}

/// Field shaping and projection collected while walking the recipe
#[derive(Debug, Default)]
struct PendingFields {
    /// `None` keeps every column
    selected: Option<Vec<String>>,
    renames: Vec<(String, String)>,
    dropped: Vec<String>,
    added: Map<String, Value>,
    /// Columns a step has written, kept across `$addFields` flushes
    written: BTreeSet<String>,
}

impl PendingFields {
    /// Expression for a column's current value, including pending changes
    fn current(&self, column: &str) -> Value {
        self.added
            .get(column)
            .cloned()
            .unwrap_or_else(|| field_ref(column))
    }

    fn set(&mut self, column: &str, value: Value) {
        self.written.insert(column.to_string());
        self.added.insert(column.to_string(), value);
    }

    fn shape(&mut self, column: &str, build: impl FnOnce(Value) -> Value) {
        let shaped = build(self.current(column));
        self.set(column, shaped);
    }

    fn take_add_fields(&mut self) -> Option<Value> {
        if self.added.is_empty() {
            return None;
        }
        Some(single("$addFields", Value::Object(std::mem::take(&mut self.added))))
    }

    /// Inclusion projection when columns were selected, exclusion otherwise
    fn project(&self) -> Option<Value> {
        let mut projection = Map::new();

        match &self.selected {
            Some(columns) => {
                for column in columns {
                    if !self.dropped.contains(column) {
                        projection.insert(column.clone(), json!(1));
                    }
                }
            }
            None => {
                // A renamed-away name that a later step wrote again is kept
                for (old, _) in &self.renames {
                    if !self.written.contains(old) {
                        projection.insert(old.clone(), json!(0));
                    }
                }
                for column in &self.dropped {
                    projection.insert(column.clone(), json!(0));
                }
            }
        }

        if projection.is_empty() {
            None
        } else {
            Some(single("$project", Value::Object(projection)))
        }
    }
}

impl MongoTransformService {
    pub fn new(config: TransformConfig) -> Self {
        Self { config }
    }

    pub fn ordering(&self) -> PipelineOrdering {
        self.config.ordering
    }

    /// Compile raw JSON steps, skipping any that do not parse
    pub fn compile_values(&self, steps: &[Value], options: &CompileOptions) -> Result<Vec<Value>> {
        let parsed: Vec<TransformStep> = steps
            .iter()
            .enumerate()
            .filter_map(|(index, raw)| match serde_json::from_value(raw.clone()) {
                Ok(step) => Some(step),
                Err(e) => {
                    warn!(index, error = %e, "Skipping malformed transform step");
                    None
                }
            })
            .collect();

        self.compile(&parsed, options)
    }

    /// Compile a recipe into pipeline stages
    pub fn compile(&self, steps: &[TransformStep], options: &CompileOptions) -> Result<Vec<Value>> {
        let mut pipeline = Vec::new();
        let mut pending = PendingFields::default();

        for step in steps {
            if self.config.ordering == PipelineOrdering::Interleaved && step.is_direct_stage() {
                pipeline.extend(pending.take_add_fields());
            }

            match step {
                TransformStep::Select { columns } => {
                    if columns.is_empty() {
                        warn!("Skipping select step without columns");
                    } else {
                        pending.selected = Some(columns.clone());
                    }
                }
                TransformStep::Rename { mappings } => self.rename(mappings, &mut pending),
                TransformStep::DropColumn { columns } => {
                    for column in columns {
                        if !pending.dropped.contains(column) {
                            pending.dropped.push(column.clone());
                        }
                    }
                }
                TransformStep::AddColumn { name, expression } => {
                    if name.is_empty() || expression.trim().is_empty() {
                        warn!("Skipping add_column step without name or expression");
                    } else {
                        pending.set(name, parse_expression(expression));
                    }
                }
                TransformStep::FillNull { column, value } => {
                    pending.shape(column, |current| {
                        single("$ifNull", Value::Array(vec![current, value.clone()]))
                    });
                }
                TransformStep::Trim { column, side, chars } => {
                    let op = match side {
                        TrimSide::Both => "$trim",
                        TrimSide::Left => "$ltrim",
                        TrimSide::Right => "$rtrim",
                    };
                    pending.shape(column, |current| {
                        let mut args = Map::new();
                        args.insert("input".to_string(), current);
                        if let Some(chars) = chars {
                            args.insert("chars".to_string(), Value::String(chars.clone()));
                        }
                        single(op, Value::Object(args))
                    });
                }
                TransformStep::Case { column, to } => {
                    let op = match to {
                        TextCase::Upper => "$toUpper",
                        TextCase::Lower => "$toLower",
                    };
                    pending.shape(column, |current| single(op, current));
                }
                TransformStep::Cast { column, to } => match cast_operator(to) {
                    Some(op) => pending.shape(column, |current| single(op, current)),
                    None => warn!(column = %column, target = %to, "Skipping cast to unknown type"),
                },
                TransformStep::Replace {
                    column,
                    find,
                    replacement,
                } => {
                    if find.is_empty() {
                        warn!(column = %column, "Skipping replace step without search text");
                    } else {
                        pending.shape(column, |current| {
                            json!({"$replaceAll": {"input": current, "find": find, "replacement": replacement}})
                        });
                    }
                }
                TransformStep::Filter { conditions, logic } => {
                    if let Some(stage) = self.match_stage(conditions, *logic) {
                        pipeline.push(stage);
                    }
                }
                TransformStep::Sort { columns } => {
                    if let Some(stage) = sort_stage(columns) {
                        pipeline.push(stage);
                    }
                }
                TransformStep::Join {
                    from,
                    local_field,
                    foreign_field,
                    alias,
                    unwind,
                } => {
                    let alias = alias.as_deref().filter(|a| !a.is_empty()).unwrap_or(from);
                    pipeline.push(json!({"$lookup": {
                        "from": from,
                        "localField": local_field,
                        "foreignField": foreign_field,
                        "as": alias,
                    }}));
                    if *unwind {
                        pipeline.push(json!({"$unwind": {
                            "path": format!("${}", alias),
                            "preserveNullAndEmptyArrays": true,
                        }}));
                    }
                }
                TransformStep::GroupBy {
                    columns,
                    aggregations,
                } => {
                    if let Some(stage) = group_stage(columns, aggregations) {
                        pipeline.push(stage);
                    }
                }
                TransformStep::Deduplicate { columns } => {
                    pipeline.push(dedupe_stage(columns, &options.available_columns)?);
                }
                TransformStep::Unknown => warn!("Skipping unknown transform step type"),
            }
        }

        pipeline.extend(pending.take_add_fields());
        pipeline.extend(pending.project());

        if let Some(skip) = options.skip.filter(|s| *s > 0) {
            pipeline.push(single("$skip", json!(skip)));
        }
        if let Some(limit) = options.limit.filter(|l| *l > 0) {
            pipeline.push(single("$limit", json!(limit)));
        }

        debug!(steps = steps.len(), stages = pipeline.len(), "Compiled transform pipeline");
        Ok(pipeline)
    }

    /// Apply every mapping of a step at once, so `{a: b, b: a}` swaps
    fn rename(&self, mappings: &BTreeMap<String, String>, pending: &mut PendingFields) {
        let moves: Vec<(&String, &String, Value)> = mappings
            .iter()
            .filter(|(old, new)| !new.is_empty() && old != new)
            .map(|(old, new)| (old, new, pending.current(old)))
            .collect();
        let targets: BTreeSet<&String> = moves.iter().map(|(_, new, _)| *new).collect();

        for (old, _, _) in &moves {
            if !targets.contains(old) {
                pending.added.remove(old.as_str());
                pending.written.remove(old.as_str());
            }
        }
        for (old, new, value) in moves {
            pending.set(new, value);
            pending.renames.push((old.clone(), new.clone()));
        }

        if let Some(selected) = pending.selected.as_mut() {
            for column in selected.iter_mut() {
                if let Some(new) = mappings.get(column.as_str()).filter(|n| !n.is_empty()) {
                    *column = new.clone();
                }
            }
        }
    }

    fn match_stage(&self, conditions: &[MatchCondition], logic: Logic) -> Option<Value> {
        let mut clauses: Vec<Value> = conditions.iter().filter_map(match_clause).collect();

        match clauses.len() {
            0 => {
                warn!("Skipping filter step without usable conditions");
                None
            }
            1 => clauses.pop().map(|clause| single("$match", clause)),
            _ => {
                let op = match logic {
                    Logic::And => "$and",
                    Logic::Or => "$or",
                };
                Some(single("$match", single(op, Value::Array(clauses))))
            }
        }
    }
}

fn match_clause(condition: &MatchCondition) -> Option<Value> {
    let column = condition.column.as_str();
    let value = &condition.value;

    let needs_value = !matches!(
        condition.operator,
        MatchOperator::IsNull | MatchOperator::IsNotNull | MatchOperator::Unsupported
    );
    if column.is_empty() || (needs_value && value.is_null()) {
        warn!(column = %column, operator = ?condition.operator, "Skipping filter condition without a value");
        return None;
    }

    let text = || lumen_core::sql::value_as_text(value);
    let regex = |pattern: String| json!({"$regex": pattern, "$options": "i"});

    let predicate = match condition.operator {
        // A bare object would be read as an operator document or exact subdocument
        MatchOperator::Eq if value.is_object() => json!({"$eq": value}),
        MatchOperator::Eq => value.clone(),
        MatchOperator::Ne => json!({"$ne": value}),
        MatchOperator::Gt => json!({"$gt": value}),
        MatchOperator::Gte => json!({"$gte": value}),
        MatchOperator::Lt => json!({"$lt": value}),
        MatchOperator::Lte => json!({"$lte": value}),
        MatchOperator::IsNull => Value::Null,
        MatchOperator::IsNotNull => json!({"$ne": null}),
        MatchOperator::In => json!({"$in": as_list(value)}),
        MatchOperator::NotIn => json!({"$nin": as_list(value)}),
        MatchOperator::Like => regex(like_to_regex(&text())),
        MatchOperator::NotLike => json!({"$not": regex(like_to_regex(&text()))}),
        MatchOperator::Contains => regex(literal_regex(&text())),
        MatchOperator::StartsWith => regex(format!("^{}", literal_regex(&text()))),
        MatchOperator::EndsWith => regex(format!("{}$", literal_regex(&text()))),
        MatchOperator::Unsupported => {
            warn!(column = %column, "Skipping filter condition with unsupported operator");
            return None;
        }
    };

    Some(single(column, predicate))
}

fn sort_stage(columns: &[SortKey]) -> Option<Value> {
    if columns.is_empty() {
        warn!("Skipping sort step without columns");
        return None;
    }

    let mut keys = Map::new();
    for key in columns {
        keys.insert(key.column.clone(), json!(key.order.as_mongo()));
    }
    Some(single("$sort", Value::Object(keys)))
}

fn group_key(columns: &[String]) -> Value {
    match columns {
        [] => Value::Null,
        [column] => field_ref(column),
        _ => Value::Object(
            columns
                .iter()
                .map(|column| (column.clone(), field_ref(column)))
                .collect(),
        ),
    }
}

fn group_stage(columns: &[String], aggregations: &[Aggregation]) -> Option<Value> {
    if columns.is_empty() && aggregations.is_empty() {
        warn!("Skipping group_by step without columns or aggregations");
        return None;
    }

    let mut group = Map::new();
    group.insert("_id".to_string(), group_key(columns));

    for aggregation in aggregations {
        let column = aggregation
            .column
            .as_deref()
            .filter(|c| !c.is_empty() && *c != "*");

        let accumulator = match (aggregation.function, column) {
            (AggFn::Count, None) => json!({"$sum": 1}),
            (AggFn::Count, Some(column)) => json!({"$sum": {
                "$cond": [{"$ne": [field_ref(column), null]}, 1, 0]
            }}),
            // Cardinality is the size of this set, taken by the caller
            (AggFn::CountDistinct, Some(column)) => single("$addToSet", field_ref(column)),
            (AggFn::Sum, Some(column)) => single("$sum", field_ref(column)),
            (AggFn::Avg, Some(column)) => single("$avg", field_ref(column)),
            (AggFn::Min, Some(column)) => single("$min", field_ref(column)),
            (AggFn::Max, Some(column)) => single("$max", field_ref(column)),
            (AggFn::First, Some(column)) => single("$first", field_ref(column)),
            (AggFn::Last, Some(column)) => single("$last", field_ref(column)),
            (function, None) => {
                warn!(function = ?function, "Skipping aggregation without a column");
                continue;
            }
        };

        let alias = aggregation.alias.clone().unwrap_or_else(|| match column {
            Some(column) => format!("{}_{}", agg_name(aggregation.function), column),
            None => "count".to_string(),
        });
        group.insert(alias, accumulator);
    }

    Some(single("$group", Value::Object(group)))
}

fn agg_name(function: AggFn) -> &'static str {
    match function {
        AggFn::Count => "count",
        AggFn::CountDistinct => "count_distinct",
        AggFn::Sum => "sum",
        AggFn::Avg => "avg",
        AggFn::Min => "min",
        AggFn::Max => "max",
        AggFn::First => "first",
        AggFn::Last => "last",
    }
}

/// Keep the first document per key. Without the collection's columns every
/// non-key field would be dropped, so that is an error rather than a skip.
fn dedupe_stage(columns: &[String], available: &[String]) -> Result<Value> {
    if available.is_empty() {
        return Err(Error::MissingAvailableColumns(columns.to_vec()));
    }

    let keys = if columns.is_empty() { available } else { columns };
    let mut id = Map::new();
    for key in keys {
        id.insert(key.clone(), field_ref(key));
    }

    let mut group = Map::new();
    group.insert("_id".to_string(), Value::Object(id));
    for column in available.iter().filter(|c| c.as_str() != "_id") {
        group.insert(column.clone(), single("$first", field_ref(column)));
    }

    Ok(single("$group", Value::Object(group)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> MongoTransformService {
        MongoTransformService::default()
    }

    fn steps(raw: Value) -> Vec<TransformStep> {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_deferred_field_shaping() {
        let recipe = steps(json!([
            {"type": "add_column", "name": "total", "expression": "price * qty"},
            {"type": "filter", "conditions": [{"column": "price", "operator": "gt", "value": 10}]}
        ]));

        let pipeline = service().compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![
                json!({"$match": {"price": {"$gt": 10}}}),
                json!({"$addFields": {"total": {"$multiply": ["$price", "$qty"]}}}),
            ]
        );
    }

    #[test]
    fn test_interleaved_field_shaping() {
        let recipe = steps(json!([
            {"type": "add_column", "name": "total", "expression": "price * qty"},
            {"type": "filter", "conditions": [{"column": "total", "operator": "gt", "value": 100}]},
            {"type": "case", "column": "name", "to": "upper"}
        ]));

        let interleaved = MongoTransformService::new(TransformConfig {
            ordering: PipelineOrdering::Interleaved,
        });
        let pipeline = interleaved.compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![
                json!({"$addFields": {"total": {"$multiply": ["$price", "$qty"]}}}),
                json!({"$match": {"total": {"$gt": 100}}}),
                json!({"$addFields": {"name": {"$toUpper": "$name"}}}),
            ]
        );
    }

    #[test]
    fn test_shaping_steps_compose() {
        let recipe = steps(json!([
            {"type": "fill_null", "column": "city", "value": "unknown"},
            {"type": "trim", "column": "city"},
            {"type": "cast", "column": "zip", "to": "int"},
            {"type": "replace", "column": "city", "find": "St.", "replacement": "Saint"}
        ]));

        let pipeline = service().compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$addFields": {
                "city": {"$replaceAll": {
                    "input": {"$trim": {"input": {"$ifNull": ["$city", "unknown"]}}},
                    "find": "St.",
                    "replacement": "Saint"
                }},
                "zip": {"$toInt": "$zip"}
            }})]
        );
    }

    #[test]
    fn test_projection() {
        let selected = steps(json!([
            {"type": "select", "columns": ["a", "b", "c"]},
            {"type": "rename", "mappings": {"a": "alpha"}},
            {"type": "drop_column", "columns": ["c"]}
        ]));
        let pipeline = service().compile(&selected, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![
                json!({"$addFields": {"alpha": "$a"}}),
                json!({"$project": {"alpha": 1, "b": 1}}),
            ]
        );

        let excluded = steps(json!([
            {"type": "rename", "mappings": {"a": "alpha"}},
            {"type": "drop_column", "columns": ["secret"]}
        ]));
        let pipeline = service().compile(&excluded, &CompileOptions::default()).unwrap();
        assert_eq!(pipeline[1], json!({"$project": {"a": 0, "secret": 0}}));
    }

    #[test]
    fn test_rename_swap() {
        let recipe = steps(json!([
            {"type": "rename", "mappings": {"first": "last", "last": "first"}}
        ]));
        let pipeline = service().compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$addFields": {"last": "$first", "first": "$last"}})]
        );

        let selected = steps(json!([
            {"type": "select", "columns": ["first", "last", "id"]},
            {"type": "rename", "mappings": {"first": "last", "last": "first"}}
        ]));
        let pipeline = service().compile(&selected, &CompileOptions::default()).unwrap();
        assert_eq!(pipeline[1], json!({"$project": {"last": 1, "first": 1, "id": 1}}));
    }

    #[test]
    fn test_renamed_away_name_reused() {
        let recipe = steps(json!([
            {"type": "rename", "mappings": {"total": "gross"}},
            {"type": "add_column", "name": "total", "expression": "gross - tax"}
        ]));
        let pipeline = service().compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$addFields": {
                "gross": "$total",
                "total": {"$subtract": ["$gross", "$tax"]}
            }})]
        );

        let interleaved = MongoTransformService::new(TransformConfig {
            ordering: PipelineOrdering::Interleaved,
        });
        let recipe = steps(json!([
            {"type": "rename", "mappings": {"a": "b", "b": "a"}},
            {"type": "sort", "columns": [{"column": "a"}]},
            {"type": "rename", "mappings": {"c": "d"}}
        ]));
        let pipeline = interleaved.compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(pipeline.last(), Some(&json!({"$project": {"c": 0}})));
    }

    #[test]
    fn test_match_operators() {
        let recipe = steps(json!([
            {"type": "filter", "logic": "or", "conditions": [
                {"column": "name", "operator": "like", "value": "%foo_bar%"},
                {"column": "code", "operator": "starts_with", "value": "A.1"},
                {"column": "tag", "operator": "not_in", "value": ["x"]},
                {"column": "deleted_at", "operator": "is_null"},
                {"column": "bad", "operator": "regex", "value": "x"},
                {"column": "missing", "operator": "eq"}
            ]}
        ]));

        let pipeline = service().compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$match": {"$or": [
                {"name": {"$regex": "^.*foo.bar.*$", "$options": "i"}},
                {"code": {"$regex": "^A\\.1", "$options": "i"}},
                {"tag": {"$nin": ["x"]}},
                {"deleted_at": null}
            ]}})]
        );
    }

    #[test]
    fn test_sort_join_and_paging() {
        let recipe = steps(json!([
            {"type": "join", "from": "customers", "local_field": "customer_id", "foreign_field": "_id", "as": "customer", "unwind": true},
            {"type": "sort", "columns": [{"column": "b", "order": "desc"}, {"column": "a"}]}
        ]));
        let options = CompileOptions {
            skip: Some(20),
            limit: Some(10),
            ..CompileOptions::default()
        };

        let pipeline = service().compile(&recipe, &options).unwrap();
        assert_eq!(
            pipeline,
            vec![
                json!({"$lookup": {"from": "customers", "localField": "customer_id", "foreignField": "_id", "as": "customer"}}),
                json!({"$unwind": {"path": "$customer", "preserveNullAndEmptyArrays": true}}),
                json!({"$sort": {"b": -1, "a": 1}}),
                json!({"$skip": 20}),
                json!({"$limit": 10}),
            ]
        );
        let sort_keys: Vec<&String> = pipeline[2]["$sort"].as_object().unwrap().keys().collect();
        assert_eq!(sort_keys, vec!["b", "a"]);
    }

    #[test]
    fn test_zero_paging_and_object_equality() {
        let recipe = steps(json!([
            {"type": "filter", "conditions": [
                {"column": "address", "operator": "eq", "value": {"$gt": ""}}
            ]}
        ]));
        let options = CompileOptions {
            skip: Some(0),
            limit: Some(0),
            ..CompileOptions::default()
        };

        let pipeline = service().compile(&recipe, &options).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$match": {"address": {"$eq": {"$gt": ""}}}})]
        );
    }

    #[test]
    fn test_group_by() {
        let recipe = steps(json!([
            {"type": "group_by", "columns": ["region"], "aggregations": [
                {"function": "count"},
                {"column": "email", "function": "count"},
                {"column": "customer_id", "function": "count_distinct", "alias": "customers"},
                {"column": "revenue", "function": "sum"},
                {"function": "avg"}
            ]}
        ]));

        let pipeline = service().compile(&recipe, &CompileOptions::default()).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$group": {
                "_id": "$region",
                "count": {"$sum": 1},
                "count_email": {"$sum": {"$cond": [{"$ne": ["$email", null]}, 1, 0]}},
                "customers": {"$addToSet": "$customer_id"},
                "sum_revenue": {"$sum": "$revenue"}
            }})]
        );
    }

    #[test]
    fn test_deduplicate() {
        let recipe = steps(json!([{"type": "deduplicate", "columns": ["email"]}]));

        let missing = service().compile(&recipe, &CompileOptions::default());
        assert!(matches!(missing, Err(Error::MissingAvailableColumns(cols)) if cols == vec!["email"]));

        let options = CompileOptions {
            available_columns: vec!["_id".to_string(), "email".to_string(), "name".to_string()],
            ..CompileOptions::default()
        };
        let pipeline = service().compile(&recipe, &options).unwrap();
        assert_eq!(
            pipeline,
            vec![json!({"$group": {
                "_id": {"email": "$email"},
                "email": {"$first": "$email"},
                "name": {"$first": "$name"}
            }})]
        );
    }

    #[test]
    fn test_compile_values_skips_bad_steps() {
        let raw = vec![
            json!({"type": "sort", "columns": [{"column": "a"}]}),
            json!({"type": "add_column", "name": "x"}),
            json!({"type": "pivot"}),
            json!({"no_type": true}),
        ];

        let pipeline = service().compile_values(&raw, &CompileOptions::default()).unwrap();
        assert_eq!(pipeline, vec![json!({"$sort": {"a": 1}})]);
    }
}
