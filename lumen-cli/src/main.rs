// Lumen command line interface
// Runs the query compilers over JSON payloads and prints the result

mod payload;

use anyhow::Context;
use clap::{Parser, Subcommand};
use lumen_core::{LoggingConfig, LumenConfig};
use lumen_query::drill::DrillthroughRequest;
use lumen_query::filter::inject_where_clause;
use lumen_query::rls::TtlPolicyCache;
use lumen_query::{DrillService, FilterService, MongoTransformService, RlsService};
use payload::{read_payload, DrillPayload, FilterPayload, PipelinePayload, RlsPayload};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lumen")]
#[command(about = "Compile filters, row-level security, drill paths and transform recipes", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (JSON, TOML or YAML)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Debug logging, unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    /// Pretty-print the JSON output
    #[arg(long, global = true)]
    pretty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile filter conditions into a WHERE clause
    Filter {
        /// Payload file, `-` for stdin
        input: PathBuf,
    },

    /// Evaluate row-level security policies for a user
    Rls {
        /// Payload file, `-` for stdin
        input: PathBuf,
    },

    /// Drill a chart up or down one level
    Drill {
        /// Payload file, `-` for stdin
        input: PathBuf,
    },

    /// Resolve a drillthrough target
    Drillthrough {
        /// Payload file, `-` for stdin
        input: PathBuf,
    },

    /// Compile a transform recipe into a MongoDB pipeline
    Pipeline {
        /// Payload file, `-` for stdin
        input: PathBuf,
    },

    /// Print the effective configuration
    Config,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(cli.config.as_ref())?;
    init_logging(&config.logging, cli.verbose)?;
    debug!(dialect = %config.sql.dialect, "Configuration loaded");

    let output = match cli.command {
        Commands::Filter { input } => run_filter(&config, read_payload(&input)?)?,
        Commands::Rls { input } => run_rls(&config, read_payload(&input)?)?,
        Commands::Drill { input } => run_drill(&config, read_payload(&input)?)?,
        Commands::Drillthrough { input } => {
            let request: DrillthroughRequest = read_payload(&input)?;
            let service = DrillService::new(config.drill.clone());
            serde_json::to_value(service.execute_drillthrough(&request))?
        }
        Commands::Pipeline { input } => run_pipeline(&config, read_payload(&input)?)?,
        Commands::Config => serde_json::to_value(&config)?,
    };

    let rendered = if cli.pretty {
        serde_json::to_string_pretty(&output)?
    } else {
        serde_json::to_string(&output)?
    };
    println!("{}", rendered);

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<LumenConfig> {
    match path {
        Some(path) => {
            let mut config = LumenConfig::from_file(path)
                .with_context(|| format!("failed to load config '{}'", path.display()))?;
            config.apply_env();
            config.validate()?;
            Ok(config)
        }
        None => {
            let config = LumenConfig::from_env();
            config.validate()?;
            Ok(config)
        }
    }
}

/// Logs go to stderr so stdout stays a single JSON document
fn init_logging(logging: &LoggingConfig, verbose: bool) -> anyhow::Result<()> {
    let fallback = if verbose { "debug" } else { logging.level.as_str() };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(fallback))
        .with_context(|| format!("invalid log level '{}'", fallback))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let installed = if logging.json {
        builder.json().try_init()
    } else {
        builder.with_target(false).try_init()
    };
    installed.map_err(|e| anyhow::anyhow!("failed to install logger: {}", e))
}

fn run_filter(config: &LumenConfig, payload: FilterPayload) -> anyhow::Result<Value> {
    let service = FilterService::from_config(&config.filter);
    let where_clause =
        service.build_where_clause(&payload.conditions, &payload.date_filters, &payload.groups)?;
    let query = payload
        .query
        .as_deref()
        .map(|query| inject_where_clause(query, &where_clause));

    Ok(json!({
        "where_clause": where_clause,
        "query": query,
    }))
}

fn run_rls(config: &LumenConfig, payload: RlsPayload) -> anyhow::Result<Value> {
    let cache = Arc::new(TtlPolicyCache::from_config(&config.rls));
    let service = RlsService::new(config.rls.clone()).with_cache(cache);
    let response = service.evaluate_access(&payload.context, &payload.policies, &payload.request);
    let query = payload
        .query
        .as_deref()
        .map(|query| service.inject_rls_filter(query, &response))
        .transpose()?;

    Ok(json!({
        "response": response,
        "query": query,
    }))
}

fn run_drill(config: &LumenConfig, payload: DrillPayload) -> anyhow::Result<Value> {
    let service = DrillService::new(config.drill.clone());
    let response = service.execute_drill(&payload.hierarchy, &payload.request)?;
    let breadcrumbs = service.get_drill_breadcrumbs(&payload.hierarchy, &response.new_path);

    Ok(json!({
        "response": response,
        "breadcrumbs": breadcrumbs,
    }))
}

fn run_pipeline(config: &LumenConfig, payload: PipelinePayload) -> anyhow::Result<Value> {
    let service = MongoTransformService::new(config.transform.clone());
    let pipeline = service.compile_values(&payload.steps, &payload.options)?;
    Ok(Value::Array(pipeline))
}
