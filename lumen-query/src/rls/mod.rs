//! Row-level security: policy selection, SQL compilation and audit.
//!
//! Policies are evaluated per request. Each applicable policy compiles to a
//! predicate and the predicates are OR-ed, so a row is visible when any
//! policy admits it. When nothing applies the configured default decides
//! between "deny everything" and "unrestricted".

mod audit;
mod cache;
mod engine;

pub use audit::{AuditDecision, AuditRecord, AuditSink, TracingAuditSink};
pub use cache::{policy_cache_key, PolicyCache, TtlPolicyCache};
pub use engine::RlsService;

use lumen_core::Logic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RlsOperator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Contains,
    StartsWith,
    GreaterThan,
    LessThan,
    Between,
    IsNull,
    IsNotNull,
    #[serde(other)]
    Unsupported,
}

/// Where a condition's comparison value comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RlsFilterType {
    /// Literal `value`
    #[default]
    Static,
    /// Resolved from the caller's security context
    Dynamic,
    /// Templated SQL fragment
    Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAttribute {
    UserId,
    Username,
    Email,
    Roles,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlsCondition {
    pub column: String,
    pub operator: RlsOperator,
    #[serde(default)]
    pub filter_type: RlsFilterType,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub user_attribute: Option<UserAttribute>,
    /// Key into [`UserSecurityContext::attributes`] for `custom` lookups
    #[serde(default)]
    pub custom_attribute: Option<String>,
    #[serde(default)]
    pub expression: Option<String>,
}

impl RlsCondition {
    pub fn fixed(column: impl Into<String>, operator: RlsOperator, value: Value) -> Self {
        Self {
            column: column.into(),
            operator,
            filter_type: RlsFilterType::Static,
            value: Some(value),
            user_attribute: None,
            custom_attribute: None,
            expression: None,
        }
    }

    pub fn dynamic(column: impl Into<String>, operator: RlsOperator, attribute: UserAttribute) -> Self {
        Self {
            column: column.into(),
            operator,
            filter_type: RlsFilterType::Dynamic,
            value: None,
            user_attribute: Some(attribute),
            custom_attribute: None,
            expression: None,
        }
    }

    pub fn custom(column: impl Into<String>, operator: RlsOperator, attribute: impl Into<String>) -> Self {
        Self {
            custom_attribute: Some(attribute.into()),
            ..Self::dynamic(column, operator, UserAttribute::Custom)
        }
    }

    pub fn expression(template: impl Into<String>) -> Self {
        Self {
            column: String::new(),
            operator: RlsOperator::Equals,
            filter_type: RlsFilterType::Expression,
            value: None,
            user_attribute: None,
            custom_attribute: None,
            expression: Some(template.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RlsNode {
    Group(RlsConditionGroup),
    Condition(RlsCondition),
}

impl From<RlsCondition> for RlsNode {
    fn from(condition: RlsCondition) -> Self {
        RlsNode::Condition(condition)
    }
}

impl From<RlsConditionGroup> for RlsNode {
    fn from(group: RlsConditionGroup) -> Self {
        RlsNode::Group(group)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RlsConditionGroup {
    #[serde(default)]
    pub logic: Logic,
    /// Required on the wire, otherwise any condition object would parse as a group
    pub conditions: Vec<RlsNode>,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RlsPolicy {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
    #[serde(default)]
    pub role_ids: Vec<String>,
    /// Lower runs first
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub filter_group: RlsConditionGroup,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Authored by someone allowed to write EXPRESSION conditions
    #[serde(default)]
    pub trusted_author: bool,
}

/// Who is asking, as established by the auth layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserSecurityContext {
    pub user_id: String,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Value>,
}

/// What is being queried
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AccessRequest {
    #[serde(default)]
    pub table_name: Option<String>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub connection_id: Option<String>,
}

impl AccessRequest {
    pub fn table(table_name: impl Into<String>) -> Self {
        Self {
            table_name: Some(table_name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RlsFilterResponse {
    pub has_filters: bool,
    pub where_clause: Option<String>,
    pub policies_applied: Vec<String>,
    pub access_denied: bool,
    pub denial_reason: Option<String>,
}

impl RlsFilterResponse {
    pub fn unrestricted() -> Self {
        Self::default()
    }

    pub fn denied(reason: impl Into<String>) -> Self {
        Self {
            access_denied: true,
            denial_reason: Some(reason.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PermissionLevel {
    None = 0,
    View = 1,
    Edit = 2,
    Admin = 3,
}

/// Grant of a permission level on some object to a user or a role
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRecord {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role_id: Option<String>,
    pub level: PermissionLevel,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_permission_ordering() {
        assert!(PermissionLevel::None < PermissionLevel::View);
        assert!(PermissionLevel::View < PermissionLevel::Edit);
        assert!(PermissionLevel::Edit < PermissionLevel::Admin);
    }

    #[test]
    fn test_policy_defaults() {
        let policy: RlsPolicy = serde_json::from_value(json!({
            "id": "p1",
            "role_ids": ["analyst"],
            "filter_group": {
                "logic": "and",
                "conditions": [
                    {"column": "region", "operator": "equals", "value": "EU"},
                    {"column": "owner", "operator": "equals", "filter_type": "dynamic", "user_attribute": "user_id"}
                ]
            }
        }))
        .unwrap();

        assert!(policy.enabled);
        assert!(!policy.trusted_author);
        assert_eq!(policy.priority, 0);
        assert_eq!(policy.filter_group.conditions.len(), 2);
    }

    #[test]
    fn test_unknown_operator() {
        let condition: RlsCondition = serde_json::from_value(json!({
            "column": "x", "operator": "matches_regex", "value": "a"
        }))
        .unwrap();
        assert_eq!(condition.operator, RlsOperator::Unsupported);
    }
}
