// Configuration for the Lumen compilers

use crate::error::{Error, Result};
use crate::types::SqlDialect;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// SQL output settings shared by the SQL compilers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SqlConfig {
    pub dialect: SqlDialect,
}

/// Filter compiler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Overrides `[sql]` when set
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialect: Option<SqlDialect>,
    /// Dialect from `[sql]`, used when `dialect` is unset
    #[serde(skip)]
    pub fallback_dialect: SqlDialect,
    /// Fail on unsupported operators instead of dropping the condition
    pub strict_operators: bool,
    /// Number of values returned by filter option lookups when the request sets none
    pub default_option_limit: usize,
}

impl FilterConfig {
    /// The section's own dialect, else the one from `[sql]`
    pub fn dialect(&self) -> SqlDialect {
        self.dialect.unwrap_or(self.fallback_dialect)
    }
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            dialect: None,
            fallback_dialect: SqlDialect::default(),
            strict_operators: false,
            default_option_limit: 100,
        }
    }
}

/// Row-level security settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RlsConfig {
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialect: Option<SqlDialect>,
    /// Dialect from `[sql]`, used when `dialect` is unset
    #[serde(skip)]
    pub fallback_dialect: SqlDialect,
    /// Deny access when no policy applies to the caller
    pub default_deny: bool,
    /// Emit an audit record for every access decision
    pub log_access: bool,
    /// Allow EXPRESSION conditions from policies with a trusted author
    pub allow_expressions: bool,
    /// Roles that are never filtered
    pub bypass_roles: HashSet<String>,
    pub cache_ttl_secs: u64,
    pub cache_max_entries: usize,
}

impl Default for RlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dialect: None,
            fallback_dialect: SqlDialect::default(),
            default_deny: true,
            log_access: true,
            allow_expressions: true,
            bypass_roles: HashSet::new(),
            cache_ttl_secs: 300,
            cache_max_entries: 10_000,
        }
    }
}

impl RlsConfig {
    pub fn dialect(&self) -> SqlDialect {
        self.dialect.unwrap_or(self.fallback_dialect)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Drill query generation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dialect: Option<SqlDialect>,
    /// Dialect from `[sql]`, used when `dialect` is unset
    #[serde(skip)]
    pub fallback_dialect: SqlDialect,
    /// Name of the CTE wrapping the chart's base query
    pub cte_name: String,
    /// Alias of the `COUNT(*)` column in drill queries
    pub count_alias: String,
}

impl DrillConfig {
    pub fn dialect(&self) -> SqlDialect {
        self.dialect.unwrap_or(self.fallback_dialect)
    }
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            dialect: None,
            fallback_dialect: SqlDialect::default(),
            cte_name: "base_data".to_string(),
            count_alias: "record_count".to_string(),
        }
    }
}

/// Where field-shaping stages land in a compiled MongoDB pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PipelineOrdering {
    /// One `$addFields` + `$project` pair at the end of the pipeline
    #[default]
    Deferred,
    /// Pending `$addFields` flushed before the next direct stage
    Interleaved,
}

/// MongoDB transform compiler settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    pub ordering: PipelineOrdering,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset
    pub level: String,
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Complete Lumen configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    pub sql: SqlConfig,
    pub filter: FilterConfig,
    pub rls: RlsConfig,
    pub drill: DrillConfig,
    pub transform: TransformConfig,
    pub logging: LoggingConfig,
}

impl LumenConfig {
    /// Load configuration from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("Failed to read '{}': {}", path.display(), e))
        })?;
        Self::from_str(&content)
    }

    /// Load configuration from a JSON, TOML or YAML string
    pub fn from_str(content: &str) -> Result<Self> {
        let mut config = if let Ok(config) = serde_json::from_str::<LumenConfig>(content) {
            config
        } else if let Ok(config) = toml::from_str::<LumenConfig>(content) {
            config
        } else if let Ok(config) = serde_yaml::from_str::<LumenConfig>(content) {
            config
        } else {
            return Err(Error::Configuration("Unknown configuration format".to_string()));
        };

        config.propagate_dialect();
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `LUMEN_*` environment variables
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env();
        config
    }

    /// Apply `LUMEN_*` environment overrides on top of the current values
    pub fn apply_env(&mut self) {
        if let Ok(dialect) = std::env::var("LUMEN_SQL_DIALECT") {
            if let Ok(d) = serde_json::from_value::<SqlDialect>(serde_json::Value::String(
                dialect.to_lowercase(),
            )) {
                self.sql.dialect = d;
            }
        }

        if let Ok(level) = std::env::var("LUMEN_LOG_LEVEL") {
            self.logging.level = level;
        }

        if let Ok(json) = std::env::var("LUMEN_LOG_JSON") {
            self.logging.json = matches!(json.as_str(), "1" | "true" | "yes");
        }

        if let Ok(deny) = std::env::var("LUMEN_RLS_DEFAULT_DENY") {
            if let Ok(v) = deny.parse::<bool>() {
                self.rls.default_deny = v;
            }
        }

        self.propagate_dialect();
    }

    /// Sections without their own dialect follow `[sql]`
    fn propagate_dialect(&mut self) {
        let dialect = self.sql.dialect;
        self.filter.fallback_dialect = dialect;
        self.rls.fallback_dialect = dialect;
        self.drill.fallback_dialect = dialect;
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.filter.default_option_limit == 0 {
            return Err(Error::Configuration(
                "filter.default_option_limit must be > 0".to_string(),
            ));
        }

        if self.rls.cache_max_entries == 0 {
            return Err(Error::Configuration(
                "rls.cache_max_entries must be > 0".to_string(),
            ));
        }

        if self.drill.cte_name.trim().is_empty() {
            return Err(Error::Configuration("drill.cte_name cannot be empty".to_string()));
        }

        if !self
            .drill
            .cte_name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(Error::Configuration(format!(
                "drill.cte_name must be a plain identifier: '{}'",
                self.drill.cte_name
            )));
        }

        Ok(())
    }
}
