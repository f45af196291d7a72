//! Drill-down navigation over a level hierarchy, plus drillthrough links.
//!
//! The service holds no navigation state: a [`DrillPath`] goes in with every
//! request and the updated path comes back for the caller to persist.

mod library;
mod navigator;

pub use library::{create_hierarchy_from_columns, get_common_hierarchies};
pub use navigator::DrillService;

use lumen_core::{Error, Result, SortOrder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillHierarchyLevel {
    pub column: String,
    pub label: String,
    #[serde(default)]
    pub sort_order: SortOrder,
    /// Display template, `{value}` is replaced by the clicked value
    #[serde(default)]
    pub format: Option<String>,
}

impl DrillHierarchyLevel {
    pub fn new(column: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            label: label.into(),
            sort_order: SortOrder::Asc,
            format: None,
        }
    }

    pub fn with_format(mut self, format: impl Into<String>) -> Self {
        self.format = Some(format.into());
        self
    }

    /// Render a value through the level's display template
    pub fn display(&self, value: &Value) -> String {
        let text = lumen_core::sql::value_as_text(value);
        match &self.format {
            Some(format) => format.replace("{value}", &text),
            None => text,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillHierarchy {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub levels: Vec<DrillHierarchyLevel>,
    /// Level a chart opens at. Presentation only, navigation always starts at 0
    #[serde(default)]
    pub default_level: usize,
}

impl DrillHierarchy {
    pub fn max_level(&self) -> usize {
        self.levels.len().saturating_sub(1)
    }

    pub fn level(&self, index: usize) -> Option<&DrillHierarchyLevel> {
        self.levels.get(index)
    }

    /// At least one level and no column used twice
    pub fn validate(&self) -> Result<()> {
        if self.levels.is_empty() {
            return Err(Error::InvalidDrillPath(format!(
                "hierarchy '{}' has no levels",
                self.id
            )));
        }

        let mut seen = HashSet::new();
        for level in &self.levels {
            if !seen.insert(level.column.as_str()) {
                return Err(Error::InvalidDrillPath(format!(
                    "hierarchy '{}' repeats column '{}'",
                    self.id, level.column
                )));
            }
        }

        Ok(())
    }
}

/// One completed drill-down step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Breadcrumb {
    pub level: usize,
    pub column: String,
    pub label: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillPath {
    pub hierarchy_id: String,
    pub current_level: usize,
    /// Column to clicked value, in drill order
    #[serde(default)]
    pub filters: Map<String, Value>,
    #[serde(default)]
    pub breadcrumbs: Vec<Breadcrumb>,
}

impl DrillPath {
    pub fn new(hierarchy_id: impl Into<String>) -> Self {
        Self {
            hierarchy_id: hierarchy_id.into(),
            current_level: 0,
            filters: Map::new(),
            breadcrumbs: Vec::new(),
        }
    }

    /// Parse a persisted path
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::InvalidDrillPath(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Check the path is a reachable state of `hierarchy`
    pub fn validate(&self, hierarchy: &DrillHierarchy) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidDrillPath(reason));

        if self.hierarchy_id != hierarchy.id {
            return invalid(format!(
                "path belongs to hierarchy '{}', not '{}'",
                self.hierarchy_id, hierarchy.id
            ));
        }
        if self.current_level > hierarchy.max_level() {
            return invalid(format!(
                "level {} is past the last level {}",
                self.current_level,
                hierarchy.max_level()
            ));
        }
        if self.breadcrumbs.len() != self.current_level {
            return invalid(format!(
                "{} breadcrumbs at level {}",
                self.breadcrumbs.len(),
                self.current_level
            ));
        }
        if self.filters.len() != self.current_level {
            return invalid(format!(
                "{} filters at level {}",
                self.filters.len(),
                self.current_level
            ));
        }

        for (index, crumb) in self.breadcrumbs.iter().enumerate() {
            let expected = &hierarchy.levels[index];
            if crumb.level != index || crumb.column != expected.column {
                return invalid(format!(
                    "breadcrumb {} does not match level '{}'",
                    index, expected.column
                ));
            }
            if !self.filters.contains_key(&crumb.column) {
                return invalid(format!("no filter for drilled column '{}'", crumb.column));
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrillDirection {
    Down,
    Up,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillRequest {
    #[serde(default)]
    pub chart_id: String,
    pub hierarchy_id: String,
    pub direction: DrillDirection,
    /// Value of the clicked data point, required when drilling down
    #[serde(default)]
    pub clicked_value: Option<Value>,
    /// Absent for a chart that has not been drilled yet
    #[serde(default)]
    pub current_path: Option<DrillPath>,
    pub base_query: String,
    /// Column summed alongside the record count
    #[serde(default)]
    pub measure: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillResponse {
    pub success: bool,
    pub new_path: DrillPath,
    /// Aggregation query for `new_path`
    pub query: String,
    pub can_drill_down: bool,
    pub can_drill_up: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Crumb as rendered in the navigation trail
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreadcrumbItem {
    pub label: String,
    /// Path level reached by clicking this crumb
    pub level: usize,
    pub value: Option<Value>,
    pub is_current: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DrillthroughTargetType {
    /// External or absolute URL
    Url,
    /// In-app page
    Page,
    /// Another dashboard
    Report,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillthroughConfig {
    pub target_type: DrillthroughTargetType,
    #[serde(default)]
    pub target_url: Option<String>,
    #[serde(default)]
    pub target_page_id: Option<String>,
    #[serde(default)]
    pub target_report_id: Option<String>,
    /// Clicked field to target parameter
    #[serde(default)]
    pub field_mappings: BTreeMap<String, String>,
    #[serde(default)]
    pub pass_all_filters: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillthroughRequest {
    #[serde(default)]
    pub chart_id: Option<String>,
    pub config: DrillthroughConfig,
    #[serde(default)]
    pub clicked_data: Map<String, Value>,
    #[serde(default)]
    pub current_filters: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrillthroughResponse {
    pub success: bool,
    pub target_type: DrillthroughTargetType,
    pub target_url: Option<String>,
    pub target_filters: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
