// JSON payloads accepted by the subcommands

use anyhow::Context;
use lumen_query::drill::{DrillHierarchy, DrillRequest};
use lumen_query::filter::{DateFilter, FilterCondition, FilterGroup};
use lumen_query::mongo::CompileOptions;
use lumen_query::rls::{AccessRequest, RlsPolicy, UserSecurityContext};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::io::Read;
use std::path::Path;

#[derive(Debug, Deserialize)]
pub struct FilterPayload {
    #[serde(default)]
    pub conditions: Vec<FilterCondition>,
    #[serde(default)]
    pub date_filters: Vec<DateFilter>,
    #[serde(default)]
    pub groups: Vec<FilterGroup>,
    /// Query to splice the clause into
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RlsPayload {
    pub context: UserSecurityContext,
    #[serde(default)]
    pub policies: Vec<RlsPolicy>,
    #[serde(default)]
    pub request: AccessRequest,
    #[serde(default)]
    pub query: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct DrillPayload {
    pub hierarchy: DrillHierarchy,
    pub request: DrillRequest,
}

#[derive(Debug, Deserialize)]
pub struct PipelinePayload {
    /// Raw steps, so one malformed step does not reject the recipe
    pub steps: Vec<Value>,
    #[serde(default)]
    pub options: CompileOptions,
}

/// Read and parse a payload from a file, or stdin when `input` is `-`
pub fn read_payload<T: DeserializeOwned>(input: &Path) -> anyhow::Result<T> {
    let raw = if input == Path::new("-") {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("failed to read payload from stdin")?;
        buf
    } else {
        std::fs::read_to_string(input)
            .with_context(|| format!("failed to read payload '{}'", input.display()))?
    };

    serde_json::from_str(&raw)
        .with_context(|| format!("invalid payload in '{}'", input.display()))
}
