use super::{
    policy_cache_key, AccessRequest, AuditDecision, AuditRecord, AuditSink, PermissionLevel,
    PermissionRecord, PolicyCache, RlsCondition, RlsConditionGroup, RlsFilterResponse,
    RlsFilterType, RlsNode, RlsOperator, RlsPolicy, TracingAuditSink, UserAttribute,
    UserSecurityContext,
};
use crate::filter::SqlStatement;
use chrono::Utc;
use lumen_core::sql::{
    as_list, escape_string, format_literal, format_literal_list, like_pattern, literal_like_pattern,
    quote_identifier, value_as_text,
};
use lumen_core::{Error, Result, RlsConfig};
use regex::{Captures, Regex};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

/// Compiles to nothing visible
const DENY_ALL: &str = "1=0";
const ALLOW_ALL: &str = "1=1";

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*([a-zA-Z0-9_.]+)\s*\}\}").expect("Invalid placeholder pattern")
    })
}

/// Evaluates row-level security policies for a caller
pub struct RlsService {
    config: RlsConfig,
    cache: Option<Arc<dyn PolicyCache>>,
    audit: Arc<dyn AuditSink>,
}

impl Default for RlsService {
    fn default() -> Self {
        Self::new(RlsConfig::default())
    }
}

impl RlsService {
    pub fn new(config: RlsConfig) -> Self {
        Self {
            config,
            cache: None,
            audit: Arc::new(TracingAuditSink),
        }
    }

    pub fn with_cache(mut self, cache: Arc<dyn PolicyCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.audit = sink;
        self
    }

    pub fn config(&self) -> &RlsConfig {
        &self.config
    }

    /// Decide what the caller may see of the requested object
    pub fn evaluate_access(
        &self,
        context: &UserSecurityContext,
        policies: &[RlsPolicy],
        request: &AccessRequest,
    ) -> RlsFilterResponse {
        if !self.config.enabled {
            return RlsFilterResponse::unrestricted();
        }

        if context
            .roles
            .iter()
            .any(|role| self.config.bypass_roles.contains(role))
        {
            let response = RlsFilterResponse::unrestricted();
            self.audit(context, policies, request, &response, AuditDecision::Bypassed);
            return response;
        }

        let cache_key = match &self.cache {
            Some(_) => match policy_cache_key(&self.config, context, policies, request) {
                Ok(key) => Some(key),
                Err(e) => {
                    warn!(error = %e, "Could not fingerprint RLS request, skipping cache");
                    None
                }
            },
            None => None,
        };

        let cached = match (&self.cache, &cache_key) {
            (Some(cache), Some(key)) => cache.get(key),
            _ => None,
        };

        let response = match cached {
            Some(hit) => {
                debug!(user_id = %context.user_id, "RLS cache hit");
                hit
            }
            None => {
                let computed = self.compute_access(context, policies, request);
                if let (Some(cache), Some(key)) = (&self.cache, cache_key) {
                    cache.insert(key, computed.clone());
                }
                computed
            }
        };

        let decision = if response.access_denied {
            AuditDecision::Denied
        } else if response.has_filters {
            AuditDecision::Filtered
        } else {
            AuditDecision::Unrestricted
        };
        self.audit(context, policies, request, &response, decision);

        response
    }

    fn compute_access(
        &self,
        context: &UserSecurityContext,
        policies: &[RlsPolicy],
        request: &AccessRequest,
    ) -> RlsFilterResponse {
        let applicable = self.applicable_policies(context, policies, request);

        if applicable.is_empty() {
            return if self.config.default_deny {
                RlsFilterResponse::denied(format!(
                    "No row-level security policy grants access to {}",
                    request.table_name.as_deref().unwrap_or("the requested data")
                ))
            } else {
                RlsFilterResponse::unrestricted()
            };
        }

        let clauses: Vec<String> = applicable
            .iter()
            .map(|policy| format!("({})", self.compile_policy(policy, context)))
            .collect();

        RlsFilterResponse {
            has_filters: true,
            where_clause: Some(clauses.join(" OR ")),
            policies_applied: applicable.iter().map(|p| p.id.clone()).collect(),
            access_denied: false,
            denial_reason: None,
        }
    }

    /// Enabled policies in scope for the request and the caller's roles, by priority
    pub fn applicable_policies<'a>(
        &self,
        context: &UserSecurityContext,
        policies: &'a [RlsPolicy],
        request: &AccessRequest,
    ) -> Vec<&'a RlsPolicy> {
        let mut applicable: Vec<&RlsPolicy> = policies
            .iter()
            .filter(|policy| policy.enabled)
            .filter(|policy| {
                scope_matches(policy.table_name.as_deref(), request.table_name.as_deref())
                    && scope_matches(policy.schema_name.as_deref(), request.schema_name.as_deref())
                    && scope_matches(
                        policy.connection_id.as_deref(),
                        request.connection_id.as_deref(),
                    )
            })
            .filter(|policy| policy.role_ids.iter().any(|role| context.roles.contains(role)))
            .collect();

        // Stable, so equal priorities keep their declaration order
        applicable.sort_by_key(|policy| policy.priority);
        applicable
    }

    /// Compile one policy's condition tree; an empty tree admits every row
    pub fn compile_policy(&self, policy: &RlsPolicy, context: &UserSecurityContext) -> String {
        let sql = self.compile_group(&policy.filter_group, context, policy.trusted_author);
        if sql.is_empty() {
            ALLOW_ALL.to_string()
        } else {
            sql
        }
    }

    /// Compile a policy as the given user would see it, for admin previews
    pub fn preview_policy(&self, policy: &RlsPolicy, context: &UserSecurityContext) -> String {
        self.compile_policy(policy, context)
    }

    pub fn compile_group(
        &self,
        group: &RlsConditionGroup,
        context: &UserSecurityContext,
        trusted: bool,
    ) -> String {
        let parts: Vec<String> = group
            .conditions
            .iter()
            .filter_map(|node| match node {
                RlsNode::Condition(condition) => {
                    Some(self.compile_condition(condition, context, trusted))
                }
                RlsNode::Group(nested) => {
                    let sql = self.compile_group(nested, context, trusted);
                    (!sql.is_empty()).then(|| format!("({})", sql))
                }
            })
            .collect();

        parts.join(group.logic.sql_separator())
    }

    /// Compile a single condition. Anything that cannot be resolved compiles
    /// to a predicate that matches no rows.
    pub fn compile_condition(
        &self,
        condition: &RlsCondition,
        context: &UserSecurityContext,
        trusted: bool,
    ) -> String {
        if condition.filter_type == RlsFilterType::Expression {
            return self.compile_expression(condition, context, trusted);
        }

        let col = quote_identifier(self.config.dialect(), &condition.column);

        let needs_value = !matches!(
            condition.operator,
            RlsOperator::IsNull | RlsOperator::IsNotNull | RlsOperator::Unsupported
        );
        let value = if needs_value {
            match self.resolve_value(condition, context) {
                Some(value) => value,
                None => {
                    warn!(
                        column = %condition.column,
                        filter_type = ?condition.filter_type,
                        "RLS condition has no value, denying rows"
                    );
                    return DENY_ALL.to_string();
                }
            }
        } else {
            Value::Null
        };

        // Wildcards are only honoured in values the policy author wrote
        let pattern = |value: &Value, leading: bool| match condition.filter_type {
            RlsFilterType::Static => like_pattern(value, leading, true),
            _ => literal_like_pattern(value, leading, true),
        };

        match condition.operator {
            RlsOperator::Equals => match &value {
                Value::Array(items) => in_list(&col, items),
                _ => format!("{} = {}", col, format_literal(&value)),
            },
            RlsOperator::NotEquals => match &value {
                Value::Array(items) => not_in_list(&col, items),
                _ => format!("{} != {}", col, format_literal(&value)),
            },
            RlsOperator::In => in_list(&col, &as_list(&value)),
            RlsOperator::NotIn => not_in_list(&col, &as_list(&value)),
            RlsOperator::Contains => format!("{} LIKE {}", col, pattern(&value, true)),
            RlsOperator::StartsWith => format!("{} LIKE {}", col, pattern(&value, false)),
            RlsOperator::GreaterThan => format!("{} > {}", col, format_literal(&value)),
            RlsOperator::LessThan => format!("{} < {}", col, format_literal(&value)),
            RlsOperator::Between => match value.as_array().map(Vec::as_slice) {
                Some([low, high]) => format!(
                    "{} BETWEEN {} AND {}",
                    col,
                    format_literal(low),
                    format_literal(high)
                ),
                _ => {
                    warn!(column = %condition.column, "RLS between needs a two element array, denying rows");
                    DENY_ALL.to_string()
                }
            },
            RlsOperator::IsNull => format!("{} IS NULL", col),
            RlsOperator::IsNotNull => format!("{} IS NOT NULL", col),
            RlsOperator::Unsupported => {
                warn!(column = %condition.column, "Unsupported RLS operator, denying rows");
                DENY_ALL.to_string()
            }
        }
    }

    fn resolve_value(&self, condition: &RlsCondition, context: &UserSecurityContext) -> Option<Value> {
        let value = match condition.filter_type {
            RlsFilterType::Static => condition.value.clone(),
            RlsFilterType::Dynamic => match condition.user_attribute? {
                UserAttribute::UserId => Some(Value::String(context.user_id.clone())),
                UserAttribute::Username => Some(Value::String(context.username.clone())),
                UserAttribute::Email => context.email.clone().map(Value::String),
                UserAttribute::Roles => Some(Value::Array(
                    context.roles.iter().cloned().map(Value::String).collect(),
                )),
                UserAttribute::Custom => condition
                    .custom_attribute
                    .as_ref()
                    .and_then(|name| context.attributes.get(name))
                    .cloned(),
            },
            RlsFilterType::Expression => None,
        };
        value.filter(|v| !v.is_null())
    }

    fn compile_expression(
        &self,
        condition: &RlsCondition,
        context: &UserSecurityContext,
        trusted: bool,
    ) -> String {
        if !(trusted && self.config.allow_expressions) {
            warn!(
                trusted_author = trusted,
                allow_expressions = self.config.allow_expressions,
                "RLS expression condition not permitted, denying rows"
            );
            return DENY_ALL.to_string();
        }

        let template = match condition.expression.as_deref().map(str::trim) {
            Some(template) if !template.is_empty() => template,
            _ => {
                warn!("RLS expression condition is empty, denying rows");
                return DENY_ALL.to_string();
            }
        };

        let mut missing = None;
        let substituted = placeholder_pattern().replace_all(template, |caps: &Captures| {
            let name = &caps[1];
            match placeholder_value(name, context) {
                Some(text) => text,
                None => {
                    missing.get_or_insert_with(|| name.to_string());
                    String::new()
                }
            }
        });

        if let Some(name) = missing {
            warn!(placeholder = %name, "Unresolved RLS expression placeholder, denying rows");
            return DENY_ALL.to_string();
        }

        format!("({})", substituted)
    }

    /// Rewrite a query so only rows admitted by `response` are returned
    pub fn inject_rls_filter(&self, query: &str, response: &RlsFilterResponse) -> Result<String> {
        let statement = SqlStatement::parse_for(self.config.dialect(), query)?;
        if statement.has_multiple_statements() {
            return Err(Error::InvalidQuery(
                "RLS filtering requires a single statement".to_string(),
            ));
        }

        let clause = if response.access_denied {
            DENY_ALL
        } else {
            match response.where_clause.as_deref() {
                Some(clause) if response.has_filters && !clause.is_empty() => clause,
                _ => return Ok(statement.sql().to_string()),
            }
        };

        Ok(statement.wrap("__rls_filtered", clause))
    }

    /// Whether the caller holds at least `required` on an object
    pub fn check_object_permission(
        &self,
        context: &UserSecurityContext,
        required: PermissionLevel,
        permissions: &[PermissionRecord],
    ) -> bool {
        if required == PermissionLevel::None {
            return true;
        }

        permissions.iter().any(|record| {
            let for_user = record.user_id.as_deref() == Some(context.user_id.as_str());
            let for_role = record
                .role_id
                .as_ref()
                .map_or(false, |role| context.roles.contains(role));
            (for_user || for_role) && record.level >= required
        })
    }

    fn audit(
        &self,
        context: &UserSecurityContext,
        policies: &[RlsPolicy],
        request: &AccessRequest,
        response: &RlsFilterResponse,
        decision: AuditDecision,
    ) {
        if !self.config.log_access {
            return;
        }

        let record = AuditRecord {
            user_id: context.user_id.clone(),
            table_name: request.table_name.clone(),
            policies_evaluated: policies.len(),
            policies_applied: response.policies_applied.clone(),
            decision,
            filters: response.where_clause.clone(),
            timestamp: Utc::now(),
        };

        if let Err(e) = self.audit.record(&record) {
            warn!(error = %e, user_id = %context.user_id, "Failed to write RLS audit record");
        }
    }
}

fn scope_matches(policy_scope: Option<&str>, requested: Option<&str>) -> bool {
    match (policy_scope, requested) {
        (None, _) => true,
        (Some(scope), Some(requested)) => scope.eq_ignore_ascii_case(requested),
        (Some(_), None) => false,
    }
}

fn in_list(col: &str, items: &[Value]) -> String {
    if items.is_empty() {
        DENY_ALL.to_string()
    } else {
        format!("{} IN ({})", col, format_literal_list(items))
    }
}

fn not_in_list(col: &str, items: &[Value]) -> String {
    if items.is_empty() {
        ALLOW_ALL.to_string()
    } else {
        format!("{} NOT IN ({})", col, format_literal_list(items))
    }
}

/// Text substituted for an expression placeholder.
///
/// Scalars are inserted with quotes doubled and the template supplies the
/// surrounding quotes; lists are inserted as a quoted literal list.
fn placeholder_value(name: &str, context: &UserSecurityContext) -> Option<String> {
    let value = match name {
        "user_id" => Value::String(context.user_id.clone()),
        "username" => Value::String(context.username.clone()),
        "email" => Value::String(context.email.clone()?),
        "roles" => Value::Array(context.roles.iter().cloned().map(Value::String).collect()),
        other => context.attributes.get(other.strip_prefix("attr.")?)?.clone(),
    };

    match value {
        Value::Null => None,
        Value::Array(items) => Some(format_literal_list(&items)),
        other => Some(escape_string(&value_as_text(&other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rls::TtlPolicyCache;
    use lumen_core::Logic;
    use parking_lot::Mutex;
    use serde_json::json;

    fn context() -> UserSecurityContext {
        UserSecurityContext {
            user_id: "u-42".to_string(),
            username: "ana".to_string(),
            email: Some("ana@example.com".to_string()),
            roles: vec!["analyst".to_string()],
            attributes: [
                ("region".to_string(), json!("EU")),
                ("team".to_string(), json!("O'Neil")),
                ("regions".to_string(), json!(["EU", "UK"])),
            ]
            .into_iter()
            .collect(),
        }
    }

    fn policy(id: &str, priority: i32, conditions: Vec<RlsNode>) -> RlsPolicy {
        RlsPolicy {
            id: id.to_string(),
            name: id.to_string(),
            table_name: Some("sales".to_string()),
            schema_name: None,
            connection_id: None,
            role_ids: vec!["analyst".to_string()],
            priority,
            filter_group: RlsConditionGroup {
                logic: Logic::And,
                conditions,
            },
            enabled: true,
            trusted_author: false,
        }
    }

    fn quiet() -> RlsConfig {
        RlsConfig {
            log_access: false,
            ..RlsConfig::default()
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        records: Mutex<Vec<AuditRecord>>,
    }

    impl AuditSink for RecordingSink {
        fn record(&self, record: &AuditRecord) -> Result<()> {
            self.records.lock().push(record.clone());
            Ok(())
        }
    }

    struct BrokenSink;

    impl AuditSink for BrokenSink {
        fn record(&self, _record: &AuditRecord) -> Result<()> {
            Err(Error::Executor("audit store offline".to_string()))
        }
    }

    #[test]
    fn test_policies_combined_with_or_by_priority() {
        let service = RlsService::new(quiet());
        let policies = vec![
            policy(
                "p2",
                2,
                vec![RlsCondition::fixed("status", RlsOperator::Equals, json!("open")).into()],
            ),
            policy(
                "p1",
                1,
                vec![RlsCondition::fixed("region", RlsOperator::Equals, json!("EU")).into()],
            ),
        ];

        let response = service.evaluate_access(&context(), &policies, &AccessRequest::table("SALES"));

        assert!(response.has_filters);
        assert!(!response.access_denied);
        assert_eq!(response.policies_applied, vec!["p1", "p2"]);
        assert_eq!(
            response.where_clause.as_deref(),
            Some("(\"region\" = 'EU') OR (\"status\" = 'open')")
        );
    }

    #[test]
    fn test_no_applicable_policy() {
        let mut other_role = policy("p1", 1, vec![]);
        other_role.role_ids = vec!["admin".to_string()];
        let mut disabled = policy("p2", 1, vec![]);
        disabled.enabled = false;
        let policies = vec![other_role, disabled];

        let denied = RlsService::new(quiet()).evaluate_access(
            &context(),
            &policies,
            &AccessRequest::table("sales"),
        );
        assert!(denied.access_denied);
        assert!(denied.denial_reason.is_some());

        let open = RlsService::new(RlsConfig {
            default_deny: false,
            ..quiet()
        })
        .evaluate_access(&context(), &policies, &AccessRequest::table("sales"));
        assert!(!open.access_denied);
        assert!(!open.has_filters);
    }

    #[test]
    fn test_scope_mismatch() {
        let service = RlsService::new(quiet());
        let mut scoped = policy("p1", 1, vec![]);
        scoped.schema_name = Some("finance".to_string());

        let request = AccessRequest {
            table_name: Some("sales".to_string()),
            schema_name: Some("public".to_string()),
            connection_id: None,
        };
        assert!(service.applicable_policies(&context(), &[scoped], &request).is_empty());
    }

    #[test]
    fn test_empty_group_admits_everything() {
        let service = RlsService::new(quiet());
        let response = service.evaluate_access(
            &context(),
            &[policy("p1", 1, vec![])],
            &AccessRequest::table("sales"),
        );
        assert_eq!(response.where_clause.as_deref(), Some("(1=1)"));
    }

    #[test]
    fn test_disabled_and_bypass() {
        let policies = vec![policy("p1", 1, vec![])];

        let disabled = RlsService::new(RlsConfig {
            enabled: false,
            ..quiet()
        });
        let response = disabled.evaluate_access(&context(), &[], &AccessRequest::table("sales"));
        assert_eq!(response, RlsFilterResponse::unrestricted());

        let sink = Arc::new(RecordingSink::default());
        let mut config = RlsConfig::default();
        config.bypass_roles.insert("analyst".to_string());
        let bypass = RlsService::new(config).with_audit_sink(sink.clone());
        let response = bypass.evaluate_access(&context(), &policies, &AccessRequest::table("sales"));
        assert!(!response.has_filters);
        assert_eq!(sink.records.lock()[0].decision, AuditDecision::Bypassed);
    }

    #[test]
    fn test_dynamic_conditions() {
        let service = RlsService::new(quiet());
        let ctx = context();

        let owner = RlsCondition::dynamic("owner_id", RlsOperator::Equals, UserAttribute::UserId);
        assert_eq!(service.compile_condition(&owner, &ctx, false), "\"owner_id\" = 'u-42'");

        let roles = RlsCondition::dynamic("role", RlsOperator::Equals, UserAttribute::Roles);
        assert_eq!(service.compile_condition(&roles, &ctx, false), "\"role\" IN ('analyst')");

        let regions = RlsCondition::custom("region", RlsOperator::In, "regions");
        assert_eq!(
            service.compile_condition(&regions, &ctx, false),
            "\"region\" IN ('EU', 'UK')"
        );

        let missing = RlsCondition::custom("cost_center", RlsOperator::Equals, "cost_center");
        assert_eq!(service.compile_condition(&missing, &ctx, false), "1=0");

        let mut no_email = ctx.clone();
        no_email.email = None;
        let email = RlsCondition::dynamic("email", RlsOperator::Equals, UserAttribute::Email);
        assert_eq!(service.compile_condition(&email, &no_email, false), "1=0");
    }

    #[test]
    fn test_user_values_match_literally_in_like() {
        let service = RlsService::new(quiet());
        let mut ctx = context();
        ctx.attributes.insert("prefix".to_string(), json!("%"));
        ctx.username = "a_b".to_string();

        let prefix = RlsCondition::custom("code", RlsOperator::StartsWith, "prefix");
        assert_eq!(
            service.compile_condition(&prefix, &ctx, false),
            "\"code\" LIKE '!%%' ESCAPE '!'"
        );

        let name = RlsCondition::dynamic("owners", RlsOperator::Contains, UserAttribute::Username);
        assert_eq!(
            service.compile_condition(&name, &ctx, false),
            "\"owners\" LIKE '%a!_b%' ESCAPE '!'"
        );
    }

    #[test]
    fn test_static_operators() {
        let service = RlsService::new(quiet());
        let ctx = context();
        let compile = |op, value| service.compile_condition(&RlsCondition::fixed("x", op, value), &ctx, false);

        assert_eq!(compile(RlsOperator::NotIn, json!([])), "1=1");
        assert_eq!(compile(RlsOperator::In, json!([])), "1=0");
        assert_eq!(compile(RlsOperator::Contains, json!("ab")), "\"x\" LIKE '%ab%'");
        assert_eq!(compile(RlsOperator::StartsWith, json!("ab")), "\"x\" LIKE 'ab%'");
        assert_eq!(compile(RlsOperator::Between, json!([1, 5])), "\"x\" BETWEEN 1 AND 5");
        assert_eq!(compile(RlsOperator::Between, json!(3)), "1=0");
        assert_eq!(compile(RlsOperator::IsNull, Value::Null), "\"x\" IS NULL");
        assert_eq!(compile(RlsOperator::Unsupported, json!(1)), "1=0");
    }

    #[test]
    fn test_nested_groups() {
        let service = RlsService::new(quiet());
        let nested = RlsConditionGroup {
            logic: Logic::Or,
            conditions: vec![
                RlsCondition::fixed("a", RlsOperator::Equals, json!(1)).into(),
                RlsCondition::fixed("b", RlsOperator::Equals, json!(2)).into(),
            ],
        };
        let p = policy(
            "p1",
            1,
            vec![
                RlsCondition::fixed("c", RlsOperator::GreaterThan, json!(0)).into(),
                nested.into(),
            ],
        );
        assert_eq!(
            service.preview_policy(&p, &context()),
            "\"c\" > 0 AND (\"a\" = 1 OR \"b\" = 2)"
        );
    }

    #[test]
    fn test_expression_requires_trusted_author() {
        let service = RlsService::new(quiet());
        let ctx = context();
        let condition = RlsCondition::expression("team = '{{ attr.team }}' AND owner = '{{user_id}}'");

        assert_eq!(service.compile_condition(&condition, &ctx, false), "1=0");
        assert_eq!(
            service.compile_condition(&condition, &ctx, true),
            "(team = 'O''Neil' AND owner = 'u-42')"
        );

        let locked = RlsService::new(RlsConfig {
            allow_expressions: false,
            ..quiet()
        });
        assert_eq!(locked.compile_condition(&condition, &ctx, true), "1=0");
    }

    #[test]
    fn test_expression_placeholders() {
        let service = RlsService::new(quiet());
        let ctx = context();

        let list = RlsCondition::expression("region IN ({{attr.regions}})");
        assert_eq!(
            service.compile_condition(&list, &ctx, true),
            "(region IN ('EU', 'UK'))"
        );

        let unknown = RlsCondition::expression("x = '{{attr.nope}}'");
        assert_eq!(service.compile_condition(&unknown, &ctx, true), "1=0");

        let bogus = RlsCondition::expression("x = '{{password}}'");
        assert_eq!(service.compile_condition(&bogus, &ctx, true), "1=0");
    }

    #[test]
    fn test_inject_rls_filter() {
        let service = RlsService::new(quiet());
        let filtered = RlsFilterResponse {
            has_filters: true,
            where_clause: Some("(\"region\" = 'EU')".to_string()),
            policies_applied: vec!["p1".to_string()],
            access_denied: false,
            denial_reason: None,
        };

        assert_eq!(
            service.inject_rls_filter("SELECT * FROM sales;", &filtered).unwrap(),
            "SELECT * FROM (SELECT * FROM sales) AS __rls_filtered WHERE (\"region\" = 'EU')"
        );
        assert_eq!(
            service
                .inject_rls_filter("SELECT 1", &RlsFilterResponse::unrestricted())
                .unwrap(),
            "SELECT 1"
        );
        assert_eq!(
            service
                .inject_rls_filter("SELECT 1", &RlsFilterResponse::denied("no"))
                .unwrap(),
            "SELECT * FROM (SELECT 1) AS __rls_filtered WHERE 1=0"
        );
        assert!(matches!(
            service.inject_rls_filter("SELECT 1; DROP TABLE sales", &filtered),
            Err(Error::InvalidQuery(_))
        ));
        assert!(service
            .inject_rls_filter("SELECT ';' AS semi", &filtered)
            .is_ok());
        assert_eq!(
            service
                .inject_rls_filter("SELECT * FROM sales -- all rows", &filtered)
                .unwrap(),
            "SELECT * FROM (SELECT * FROM sales) AS __rls_filtered WHERE (\"region\" = 'EU')"
        );
        assert!(matches!(
            service.inject_rls_filter("SELECT 'unterminated", &filtered),
            Err(Error::InvalidQuery(_))
        ));
    }

    #[test]
    fn test_check_object_permission() {
        let service = RlsService::new(quiet());
        let ctx = context();
        let grants = vec![
            PermissionRecord {
                user_id: Some("u-42".to_string()),
                role_id: None,
                level: PermissionLevel::View,
            },
            PermissionRecord {
                user_id: None,
                role_id: Some("analyst".to_string()),
                level: PermissionLevel::Edit,
            },
            PermissionRecord {
                user_id: Some("someone-else".to_string()),
                role_id: None,
                level: PermissionLevel::Admin,
            },
        ];

        assert!(service.check_object_permission(&ctx, PermissionLevel::None, &[]));
        assert!(service.check_object_permission(&ctx, PermissionLevel::Edit, &grants));
        assert!(!service.check_object_permission(&ctx, PermissionLevel::Admin, &grants));
    }

    #[test]
    fn test_audit_records_and_sink_failures() {
        let sink = Arc::new(RecordingSink::default());
        let service = RlsService::new(RlsConfig::default()).with_audit_sink(sink.clone());
        let policies = vec![policy("p1", 1, vec![])];

        service.evaluate_access(&context(), &policies, &AccessRequest::table("sales"));
        service.evaluate_access(&context(), &policies, &AccessRequest::table("orders"));

        let records = sink.records.lock();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].decision, AuditDecision::Filtered);
        assert_eq!(records[0].policies_applied, vec!["p1"]);
        assert_eq!(records[1].decision, AuditDecision::Denied);
        assert_eq!(records[1].policies_evaluated, 1);
        drop(records);

        let broken = RlsService::new(RlsConfig::default()).with_audit_sink(Arc::new(BrokenSink));
        let response = broken.evaluate_access(&context(), &policies, &AccessRequest::table("sales"));
        assert!(response.has_filters);
    }

    #[test]
    fn test_cached_decisions() {
        let cache = Arc::new(TtlPolicyCache::new(16, std::time::Duration::from_secs(60)));
        let service = RlsService::new(quiet()).with_cache(cache.clone());
        let policies = vec![policy(
            "p1",
            1,
            vec![RlsCondition::fixed("region", RlsOperator::Equals, json!("EU")).into()],
        )];

        let first = service.evaluate_access(&context(), &policies, &AccessRequest::table("sales"));
        assert_eq!(cache.len(), 1);
        let second = service.evaluate_access(&context(), &policies, &AccessRequest::table("sales"));
        assert_eq!(first, second);

        let mut other = context();
        other.user_id = "u-7".to_string();
        service.evaluate_access(&other, &policies, &AccessRequest::table("sales"));
        assert_eq!(cache.len(), 2);
    }
}
