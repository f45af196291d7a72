use super::{
    Breadcrumb, BreadcrumbItem, DrillDirection, DrillHierarchy, DrillPath, DrillRequest,
    DrillResponse, DrillthroughRequest, DrillthroughResponse, DrillthroughTargetType,
};
use crate::filter::SqlStatement;
use lumen_core::sql::{format_literal, quote_identifier, value_as_text};
use lumen_core::{DrillConfig, Error, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Drill state machine and query builder
#[derive(Debug, Clone, Default)]
pub struct DrillService {
    config: DrillConfig,
}

impl DrillService {
    pub fn new(config: DrillConfig) -> Self {
        Self { config }
    }

    pub fn initial_path(&self, hierarchy: &DrillHierarchy) -> DrillPath {
        DrillPath::new(hierarchy.id.clone())
    }

    /// Move one level down or up.
    ///
    /// Hitting either end of the hierarchy is not an error: the response has
    /// `success = false` and carries the unchanged path.
    pub fn execute_drill(
        &self,
        hierarchy: &DrillHierarchy,
        request: &DrillRequest,
    ) -> Result<DrillResponse> {
        hierarchy.validate()?;
        if request.hierarchy_id != hierarchy.id {
            return Err(Error::InvalidRequest(format!(
                "request targets hierarchy '{}' but '{}' was supplied",
                request.hierarchy_id, hierarchy.id
            )));
        }

        let mut path = match &request.current_path {
            Some(path) => path.clone(),
            None => self.initial_path(hierarchy),
        };
        path.validate(hierarchy)?;

        let measure = request.measure.as_deref();

        match request.direction {
            DrillDirection::Down => {
                if path.current_level >= hierarchy.max_level() {
                    debug!(chart_id = %request.chart_id, level = path.current_level, "Already at deepest level");
                    return self.boundary(hierarchy, path, &request.base_query, measure, "already at the deepest level");
                }

                let value = request
                    .clicked_value
                    .clone()
                    .ok_or_else(|| Error::InvalidRequest("drilling down requires a clicked value".to_string()))?;

                let level = &hierarchy.levels[path.current_level];
                path.filters.insert(level.column.clone(), value.clone());
                path.breadcrumbs.push(Breadcrumb {
                    level: path.current_level,
                    column: level.column.clone(),
                    label: level.label.clone(),
                    value,
                });
                path.current_level += 1;
            }
            DrillDirection::Up => {
                if path.current_level == 0 {
                    debug!(chart_id = %request.chart_id, "Already at top level");
                    return self.boundary(hierarchy, path, &request.base_query, measure, "already at the top level");
                }

                if let Some(crumb) = path.breadcrumbs.pop() {
                    path.filters.remove(&crumb.column);
                }
                path.current_level -= 1;
            }
        }

        debug!(
            chart_id = %request.chart_id,
            hierarchy = %hierarchy.id,
            level = path.current_level,
            "Drill step"
        );
        self.respond(hierarchy, path, &request.base_query, measure)
    }

    /// Jump back to a shallower level, as when a breadcrumb is clicked
    pub fn drill_to_level(
        &self,
        hierarchy: &DrillHierarchy,
        path: &DrillPath,
        target_level: usize,
        base_query: &str,
        measure: Option<&str>,
    ) -> Result<DrillResponse> {
        hierarchy.validate()?;
        path.validate(hierarchy)?;

        let mut path = path.clone();
        if target_level > path.current_level {
            return self.boundary(hierarchy, path, base_query, measure, "cannot jump below the current level");
        }

        while path.breadcrumbs.len() > target_level {
            if let Some(crumb) = path.breadcrumbs.pop() {
                path.filters.remove(&crumb.column);
            }
        }
        path.current_level = target_level;

        self.respond(hierarchy, path, base_query, measure)
    }

    pub fn reset_drill(
        &self,
        hierarchy: &DrillHierarchy,
        base_query: &str,
        measure: Option<&str>,
    ) -> Result<DrillResponse> {
        hierarchy.validate()?;
        self.respond(hierarchy, self.initial_path(hierarchy), base_query, measure)
    }

    /// Aggregate the base query by the path's current level, filtered by every
    /// value drilled through so far
    pub fn build_drill_query(
        &self,
        hierarchy: &DrillHierarchy,
        path: &DrillPath,
        base_query: &str,
        measure: Option<&str>,
    ) -> Result<String> {
        let base = SqlStatement::parse_for(self.config.dialect(), base_query)?;
        if base.has_multiple_statements() {
            return Err(Error::InvalidQuery(
                "drill base query must be a single statement".to_string(),
            ));
        }
        if base.is_empty() {
            return Err(Error::InvalidQuery("drill base query is empty".to_string()));
        }

        let level = hierarchy.level(path.current_level).ok_or_else(|| {
            Error::InvalidDrillPath(format!("no level {} in '{}'", path.current_level, hierarchy.id))
        })?;

        let quote = |name: &str| quote_identifier(self.config.dialect(), name);
        let col = quote(&level.column);
        let cte = quote(&self.config.cte_name);

        let mut select = format!("{}, COUNT(*) AS {}", col, quote(&self.config.count_alias));
        if let Some(measure) = measure.filter(|m| !m.is_empty()) {
            let measure = quote(measure);
            select.push_str(&format!(", SUM({}) AS {}", measure, measure));
        }

        let predicates: Vec<String> = path
            .filters
            .iter()
            .map(|(column, value)| match value {
                Value::Null => format!("{} IS NULL", quote(column)),
                _ => format!("{} = {}", quote(column), format_literal(value)),
            })
            .collect();
        let where_sql = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };

        Ok(format!(
            "WITH {cte} AS ({}) SELECT {select} FROM {cte}{where_sql} GROUP BY {col} ORDER BY {col} {}",
            base.sql(),
            level.sort_order.as_sql(),
        ))
    }

    /// Trail for the path, starting with the root crumb
    pub fn get_drill_breadcrumbs(
        &self,
        hierarchy: &DrillHierarchy,
        path: &DrillPath,
    ) -> Vec<BreadcrumbItem> {
        let mut items = Vec::with_capacity(path.breadcrumbs.len() + 1);
        items.push(BreadcrumbItem {
            label: "All".to_string(),
            level: 0,
            value: None,
            is_current: path.breadcrumbs.is_empty(),
        });

        let last = path.breadcrumbs.len();
        for (index, crumb) in path.breadcrumbs.iter().enumerate() {
            let shown = match hierarchy.level(crumb.level) {
                Some(level) => level.display(&crumb.value),
                None => value_as_text(&crumb.value),
            };
            items.push(BreadcrumbItem {
                label: format!("{}: {}", crumb.label, shown),
                level: crumb.level + 1,
                value: Some(crumb.value.clone()),
                is_current: index + 1 == last,
            });
        }

        items
    }

    /// Resolve the navigation target for a clicked data point
    pub fn execute_drillthrough(&self, request: &DrillthroughRequest) -> DrillthroughResponse {
        let config = &request.config;

        let mut params: BTreeMap<String, Value> = BTreeMap::new();
        for (source, target) in &config.field_mappings {
            match request.clicked_data.get(source) {
                Some(value) => {
                    params.insert(target.clone(), value.clone());
                }
                None => debug!(field = %source, "Mapped drillthrough field not in clicked data"),
            }
        }
        if config.pass_all_filters {
            for (key, value) in &request.current_filters {
                params.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }

        let target = match config.target_type {
            DrillthroughTargetType::Url => config.target_url.as_deref().map(str::to_string),
            DrillthroughTargetType::Page => config
                .target_page_id
                .as_deref()
                .map(|id| format!("/pages/{}", urlencoding::encode(id))),
            DrillthroughTargetType::Report => config
                .target_report_id
                .as_deref()
                .map(|id| format!("/dashboards/{}", urlencoding::encode(id))),
        }
        .filter(|target| !target.is_empty());

        let Some(mut target_url) = target else {
            warn!(target_type = ?config.target_type, "Drillthrough target is not configured");
            return DrillthroughResponse {
                success: false,
                target_type: config.target_type,
                target_url: None,
                target_filters: params,
                error: Some(format!("no target configured for {:?} drillthrough", config.target_type)),
            };
        };

        if !params.is_empty() {
            let query = params
                .iter()
                .map(|(key, value)| {
                    format!(
                        "{}={}",
                        urlencoding::encode(key),
                        urlencoding::encode(&value_as_text(value))
                    )
                })
                .collect::<Vec<_>>()
                .join("&");
            target_url.push(if target_url.contains('?') { '&' } else { '?' });
            target_url.push_str(&query);
        }

        DrillthroughResponse {
            success: true,
            target_type: config.target_type,
            target_url: Some(target_url),
            target_filters: params,
            error: None,
        }
    }

    fn respond(
        &self,
        hierarchy: &DrillHierarchy,
        path: DrillPath,
        base_query: &str,
        measure: Option<&str>,
    ) -> Result<DrillResponse> {
        let query = self.build_drill_query(hierarchy, &path, base_query, measure)?;
        Ok(DrillResponse {
            success: true,
            can_drill_down: path.current_level < hierarchy.max_level(),
            can_drill_up: path.current_level > 0,
            new_path: path,
            query,
            error: None,
        })
    }

    fn boundary(
        &self,
        hierarchy: &DrillHierarchy,
        path: DrillPath,
        base_query: &str,
        measure: Option<&str>,
        reason: &str,
    ) -> Result<DrillResponse> {
        let mut response = self.respond(hierarchy, path, base_query, measure)?;
        response.success = false;
        response.error = Some(reason.to_string());
        Ok(response)
    }
}
