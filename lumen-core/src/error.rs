use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Unsupported operator for column '{column}': {operator}")]
    UnsupportedOperator { column: String, operator: String },

    #[error("Missing value for column '{column}': {reason}")]
    MissingValue { column: String, reason: String },

    #[error("Invalid date: {0}")]
    InvalidDate(String),

    #[error("Invalid query: {0}")]
    InvalidQuery(String),

    #[error("Invalid drill path: {0}")]
    InvalidDrillPath(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Deduplicate step on {0:?} requires available_columns; other fields would be dropped")]
    MissingAvailableColumns(Vec<String>),

    #[error("Query executor error: {0}")]
    Executor(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
