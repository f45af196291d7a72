//! Transform recipes compiled to MongoDB aggregation pipelines.
//!
//! A recipe is an ordered list of [`TransformStep`]s. Steps with a direct
//! stage equivalent (filter, sort, join, group, dedupe) become stages in
//! order. Field-shaping steps accumulate into one `$addFields` stage and
//! column selection into one `$project` stage; where those land is governed
//! by [`lumen_core::PipelineOrdering`].

mod compiler;
mod expr;
mod pattern;

pub use compiler::MongoTransformService;
pub use expr::{cast_operator, parse_expression};
pub use pattern::like_to_regex;

use lumen_core::{Logic, SortOrder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchOperator {
    #[serde(alias = "=", alias = "equals")]
    Eq,
    #[serde(alias = "!=", alias = "not_equals")]
    Ne,
    #[serde(alias = ">", alias = "greater_than")]
    Gt,
    #[serde(alias = ">=", alias = "greater_than_or_equal")]
    Gte,
    #[serde(alias = "<", alias = "less_than")]
    Lt,
    #[serde(alias = "<=", alias = "less_than_or_equal")]
    Lte,
    IsNull,
    IsNotNull,
    In,
    NotIn,
    Like,
    NotLike,
    Contains,
    StartsWith,
    EndsWith,
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchCondition {
    pub column: String,
    pub operator: MatchOperator,
    #[serde(default)]
    pub value: Value,
}

impl MatchCondition {
    pub fn new(column: impl Into<String>, operator: MatchOperator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            value,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: String,
    #[serde(default)]
    pub order: SortOrder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggFn {
    Count,
    CountDistinct,
    Sum,
    Avg,
    Min,
    Max,
    First,
    Last,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregation {
    /// `None` or `*` counts documents
    #[serde(default)]
    pub column: Option<String>,
    pub function: AggFn,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrimSide {
    #[default]
    Both,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TextCase {
    Upper,
    Lower,
}

/// One step of a transform recipe, tagged by `type` on the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformStep {
    Select {
        #[serde(default)]
        columns: Vec<String>,
    },
    Rename {
        /// Old name to new name
        #[serde(default)]
        mappings: BTreeMap<String, String>,
    },
    DropColumn {
        #[serde(default)]
        columns: Vec<String>,
    },
    AddColumn {
        name: String,
        expression: String,
    },
    Filter {
        #[serde(default)]
        conditions: Vec<MatchCondition>,
        #[serde(default)]
        logic: Logic,
    },
    Sort {
        #[serde(default)]
        columns: Vec<SortKey>,
    },
    Join {
        from: String,
        local_field: String,
        foreign_field: String,
        /// Output array field, defaults to `from`
        #[serde(default, rename = "as")]
        alias: Option<String>,
        #[serde(default)]
        unwind: bool,
    },
    GroupBy {
        #[serde(default)]
        columns: Vec<String>,
        #[serde(default)]
        aggregations: Vec<Aggregation>,
    },
    Deduplicate {
        /// Key columns; empty means the whole row
        #[serde(default)]
        columns: Vec<String>,
    },
    FillNull {
        column: String,
        value: Value,
    },
    Trim {
        column: String,
        #[serde(default)]
        side: TrimSide,
        #[serde(default)]
        chars: Option<String>,
    },
    Case {
        column: String,
        to: TextCase,
    },
    Cast {
        column: String,
        to: String,
    },
    Replace {
        column: String,
        find: String,
        #[serde(default)]
        replacement: String,
    },
    #[serde(other)]
    Unknown,
}

impl TransformStep {
    pub fn kind(&self) -> &'static str {
        match self {
            TransformStep::Select { .. } => "select",
            TransformStep::Rename { .. } => "rename",
            TransformStep::DropColumn { .. } => "drop_column",
            TransformStep::AddColumn { .. } => "add_column",
            TransformStep::Filter { .. } => "filter",
            TransformStep::Sort { .. } => "sort",
            TransformStep::Join { .. } => "join",
            TransformStep::GroupBy { .. } => "group_by",
            TransformStep::Deduplicate { .. } => "deduplicate",
            TransformStep::FillNull { .. } => "fill_null",
            TransformStep::Trim { .. } => "trim",
            TransformStep::Case { .. } => "case",
            TransformStep::Cast { .. } => "cast",
            TransformStep::Replace { .. } => "replace",
            TransformStep::Unknown => "unknown",
        }
    }

    /// Steps emitted as a pipeline stage where they appear
    pub fn is_direct_stage(&self) -> bool {
        matches!(
            self,
            TransformStep::Filter { .. }
                | TransformStep::Sort { .. }
                | TransformStep::Join { .. }
                | TransformStep::GroupBy { .. }
                | TransformStep::Deduplicate { .. }
        )
    }

    /// Steps that only reshape fields and are batched into `$addFields`
    pub fn is_field_shaping(&self) -> bool {
        matches!(
            self,
            TransformStep::AddColumn { .. }
                | TransformStep::FillNull { .. }
                | TransformStep::Trim { .. }
                | TransformStep::Case { .. }
                | TransformStep::Cast { .. }
                | TransformStep::Replace { .. }
        )
    }
}

/// Inputs to a compile that are not part of the recipe
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CompileOptions {
    /// Columns of the source collection, needed by deduplicate
    pub available_columns: Vec<String>,
    pub skip: Option<u64>,
    pub limit: Option<u64>,
}
