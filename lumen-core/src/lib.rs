pub mod types;
pub mod error;
pub mod sql;
pub mod config;
pub mod cache;

pub use error::{Error, Result};
pub use types::{Logic, SortOrder, SqlDialect};
pub use config::{
    DrillConfig, FilterConfig, LoggingConfig, LumenConfig, PipelineOrdering, RlsConfig,
    SqlConfig, TransformConfig,
};
pub use cache::TtlCache;
