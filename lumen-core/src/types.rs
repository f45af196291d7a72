use serde::{Deserialize, Serialize};
use std::fmt;

/// Target SQL dialect for identifier quoting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SqlDialect {
    #[default]
    Postgres,
    Mysql,
    Sqlite,
}

impl SqlDialect {
    /// Quote character used around identifiers
    pub fn identifier_quote(&self) -> char {
        match self {
            SqlDialect::Mysql => '`',
            SqlDialect::Postgres | SqlDialect::Sqlite => '"',
        }
    }

    /// Type name used when casting a column to text
    pub fn text_type(&self) -> &'static str {
        match self {
            SqlDialect::Mysql => "CHAR",
            SqlDialect::Postgres | SqlDialect::Sqlite => "TEXT",
        }
    }
}

impl fmt::Display for SqlDialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SqlDialect::Postgres => write!(f, "postgres"),
            SqlDialect::Mysql => write!(f, "mysql"),
            SqlDialect::Sqlite => write!(f, "sqlite"),
        }
    }
}

/// Boolean connective for condition groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Logic {
    #[default]
    And,
    Or,
}

impl Logic {
    /// Separator used when joining compiled SQL fragments
    pub fn sql_separator(&self) -> &'static str {
        match self {
            Logic::And => " AND ",
            Logic::Or => " OR ",
        }
    }
}

impl fmt::Display for Logic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Logic::And => write!(f, "AND"),
            Logic::Or => write!(f, "OR"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

impl SortOrder {
    pub fn as_sql(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }

    /// MongoDB `$sort` direction
    pub fn as_mongo(&self) -> i32 {
        match self {
            SortOrder::Asc => 1,
            SortOrder::Desc => -1,
        }
    }
}
