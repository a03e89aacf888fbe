pub mod cache;
pub mod config;
pub mod export;
pub mod logging;
pub mod model;
pub mod schema;
pub mod search;
pub mod upstream;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};

use cache::{CacheError, CacheStore};
use config::AppConfig;
use export::{ExportFormat, ExportOptions};
use schema::SchemaRegistry;
use search::{FilterGroupSpec, FilterSpec, GroupOp, SearchEngine, SearchError, SearchRequest};
use upstream::{Credentials, CrmClient, TOKEN_ENV};

/// Exit code for "cache not ready yet, try again" (EX_TEMPFAIL).
pub const EXIT_NOT_READY: u8 = 75;
/// Exit code for a malformed request.
pub const EXIT_BAD_REQUEST: u8 = 2;

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "ppsearch",
    version,
    about = "Faceted search over CRM partners, programs and sessions"
)]
pub struct Cli {
    /// CRM bearer token
    #[arg(long, env = TOKEN_ENV, hide_env_values = true, global = true)]
    pub token: Option<String>,

    /// Config file (defaults to the platform config dir)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Directory with partner.json, program.json and session.json
    #[arg(long, global = true)]
    pub schema_dir: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Also write logs to this file
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Print filterable/facetable fields as JSON (no network)
    Schema,
    /// Print cache status as JSON
    Status {
        /// Load the cache before reporting
        #[arg(long)]
        refresh: bool,
    },
    /// Force a cache refresh
    Refresh {
        /// Also wait for associations to finish loading
        #[arg(long)]
        wait: bool,
    },
    /// Search programs
    Search(SearchArgs),
}

#[derive(Args, Debug)]
pub struct SearchArgs {
    /// Free-text query
    pub query: Option<String>,

    /// Filter tree as JSON, or @path to read it from a file
    #[arg(long)]
    pub filters: Option<String>,

    /// Restrict to one program type
    #[arg(long)]
    pub kind: Option<String>,

    #[arg(long)]
    pub page: Option<usize>,

    #[arg(long)]
    pub page_size: Option<usize>,

    /// Keep programs with no matching sessions
    #[arg(long)]
    pub include_childless: bool,

    #[arg(long, value_enum, default_value_t = ExportFormat::Json)]
    pub format: ExportFormat,
}

pub async fn run() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_file.as_deref())?;

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    }
    .context("loading configuration")?;

    let schema_dir = match &cli.schema_dir {
        Some(dir) => dir.clone(),
        None => config.schema_dir()?,
    };
    let schema = Arc::new(
        SchemaRegistry::load_dir(&schema_dir)
            .with_context(|| format!("loading schema from {}", schema_dir.display()))?,
    );

    match cli.command {
        Commands::Schema => print_json(&schema.describe()),
        Commands::Status { refresh } => {
            let store = open_store(&config, schema)?;
            if refresh {
                warm(&store, &credentials(cli.token.as_deref())?).await?;
            }
            print_json(&store.status())
        }
        Commands::Refresh { wait } => {
            let store = open_store(&config, schema)?;
            run_refresh(&store, &credentials(cli.token.as_deref())?, wait).await
        }
        Commands::Search(args) => {
            let store = open_store(&config, schema.clone())?;
            let engine = SearchEngine::new(schema.clone(), config.search);
            let request = build_request(&args)?;
            // Reject malformed requests before any network traffic.
            engine.compile(&request).map_err(SearchError::from)?;

            let creds = credentials(cli.token.as_deref())?;
            warm(&store, &creds).await?;
            let response = engine.search(&store, &creds, &request).await?;

            let options = ExportOptions {
                query: request.query.clone(),
                ..ExportOptions::default()
            };
            println!(
                "{}",
                export::export_response(&schema, &response, args.format, &options)
            );
            Ok(())
        }
    }
}

/// Exit status for an error returned by [`run`].
pub fn exit_code(err: &anyhow::Error) -> u8 {
    for cause in err.chain() {
        if let Some(search) = cause.downcast_ref::<SearchError>() {
            return match search {
                SearchError::NotReady(_) => EXIT_NOT_READY,
                SearchError::Request(_) => EXIT_BAD_REQUEST,
            };
        }
        if cause.downcast_ref::<search::RequestError>().is_some() {
            return EXIT_BAD_REQUEST;
        }
    }
    1
}

fn credentials(token: Option<&str>) -> Result<Credentials> {
    match token.map(str::trim).filter(|t| !t.is_empty()) {
        Some(token) => Ok(Credentials::bearer(token)),
        None => bail!("no CRM token; pass --token or set {TOKEN_ENV}"),
    }
}

fn open_store(config: &AppConfig, schema: Arc<SchemaRegistry>) -> Result<CacheStore> {
    let client = CrmClient::new(&config.upstream).context("building CRM client")?;
    Ok(CacheStore::new(
        schema,
        client,
        config.associations,
        config.cache,
    ))
}

/// Load objects and wait for associations. A one-shot process starts cold,
/// and without associations every program would look childless.
async fn warm(store: &CacheStore, creds: &Credentials) -> Result<()> {
    let outcome = store.refresh(creds).await.context("refreshing cache")?;
    if let Some(handle) = outcome.associations {
        handle.await.context("association task panicked")?;
    }
    Ok(())
}

async fn run_refresh(store: &CacheStore, creds: &Credentials, wait: bool) -> Result<()> {
    let outcome = match store.refresh(creds).await {
        Ok(outcome) => outcome,
        Err(CacheError::RefreshInProgress) => bail!("a refresh is already running"),
        Err(err) => return Err(err).context("refreshing cache"),
    };

    let associations = match (wait, outcome.associations) {
        (true, Some(handle)) => Some(handle.await.context("association task panicked")?),
        _ => None,
    };
    print_json(&serde_json::json!({
        "generation": outcome.generation,
        "counts": outcome.counts,
        "associations": associations,
    }))
}

fn build_request(args: &SearchArgs) -> Result<SearchRequest> {
    let mut request = SearchRequest {
        query: args.query.clone(),
        kind: args.kind.clone(),
        page: args.page,
        page_size: args.page_size,
        include_childless: args.include_childless,
        ..SearchRequest::default()
    };
    if let Some(raw) = &args.filters {
        request.filters = Some(parse_filters(raw)?);
    }
    Ok(request)
}

/// `--filters` accepts a group object, a bare array of leaves (AND-ed), or
/// `@path` pointing at either.
fn parse_filters(raw: &str) -> Result<FilterGroupSpec> {
    let text = match raw.strip_prefix('@') {
        Some(path) => read_filter_file(Path::new(path))?,
        None => raw.to_string(),
    };
    let value: serde_json::Value =
        serde_json::from_str(&text).context("--filters is not valid JSON")?;
    if value.is_array() {
        let filters: Vec<FilterSpec> =
            serde_json::from_value(value).context("--filters array has an invalid entry")?;
        return Ok(FilterGroupSpec {
            op: GroupOp::And,
            filters,
            groups: Vec::new(),
        });
    }
    serde_json::from_value(value).context("--filters is not a filter group")
}

fn read_filter_file(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading filters from {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
