use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use gcptables::config::Config;
use gcptables::engine::retry::RetryPolicy;
use gcptables::engine::{HydrationEngine, QueryRequest, QueryStatus};
use gcptables::gcp::auth::GcpCredentials;
use gcptables::gcp::client::GcpClient;
use gcptables::gcp::projects::ProjectEnumerator;
use gcptables::plugin::{self, PluginDescriptor};
use gcptables::resource::{Qualifier, SchemaRegistry};
use gcptables::scope::{ScopeEnumerator, StaticScopes};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use tracing_subscriber::EnvFilter;

/// GCP resources as tables for a host query engine
#[derive(Parser, Debug)]
#[command(name = "gcptables", version = gcptables::VERSION, about, long_about = None)]
struct Args {
    /// Config file (JSON or YAML); defaults to <config dir>/gcptables/config.*
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// GCP project to query (repeatable); skips project discovery
    #[arg(short, long, global = true)]
    project: Vec<String>,

    /// Log level for debugging
    #[arg(long, value_enum, default_value = "off", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Answer host requests as JSON lines on stdin/stdout (default)
    Serve,
    /// Print the plugin descriptor
    Describe,
    /// Run a single query and print rows as JSON lines
    Query {
        table: String,

        /// Column to project (repeatable); all columns when omitted
        #[arg(short, long = "column")]
        columns: Vec<String>,

        /// Equality filter (repeatable)
        #[arg(short = 'w', long = "where", value_name = "COLUMN=VALUE", value_parser = parse_filter)]
        filters: Vec<Qualifier>,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Off,
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn to_tracing_level(self) -> Option<Level> {
        match self {
            LogLevel::Off => None,
            LogLevel::Error => Some(Level::ERROR),
            LogLevel::Warn => Some(Level::WARN),
            LogLevel::Info => Some(Level::INFO),
            LogLevel::Debug => Some(Level::DEBUG),
            LogLevel::Trace => Some(Level::TRACE),
        }
    }
}

fn parse_filter(s: &str) -> Result<Qualifier, String> {
    let (column, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected COLUMN=VALUE, got {s}"))?;
    Ok(Qualifier::equals(column.trim(), value.trim()))
}

/// Logs go to a file: stdout belongs to the host protocol.
fn setup_logging(level: LogLevel) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let tracing_level = level.to_tracing_level()?;

    let log_path = get_log_path();

    if let Some(parent) = log_path.parent() {
        let _ = std::fs::create_dir_all(parent);
    }

    let file = match std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
    {
        Ok(f) => f,
        Err(e) => {
            eprintln!("Failed to open log file {}: {}", log_path.display(), e);
            return None;
        }
    };

    let (non_blocking, guard) = tracing_appender::non_blocking(file);

    // GCPTABLES_LOG takes per-module directives, e.g. "gcptables::engine=trace"
    let filter = EnvFilter::try_from_env("GCPTABLES_LOG")
        .unwrap_or_else(|_| EnvFilter::new(tracing_level.as_str()));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .init();

    tracing::info!("gcptables started with log level: {:?}", level);
    tracing::info!("Log file: {:?}", log_path);

    Some(guard)
}

fn get_log_path() -> PathBuf {
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("gcptables").join("gcptables.log");
    }
    if let Some(home) = dirs::home_dir() {
        return home.join(".gcptables").join("gcptables.log");
    }
    PathBuf::from("gcptables.log")
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let _log_guard = setup_logging(args.log_level);

    match run(args).await {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{:#}", err);
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<ExitCode> {
    let mut config = Config::load(args.config.as_deref())?;
    if !args.project.is_empty() {
        config.projects = args.project.clone();
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Interrupted, canceling");
            on_interrupt.cancel();
        }
    });

    match args.command.unwrap_or(Command::Serve) {
        Command::Describe => {
            let descriptor = PluginDescriptor::new(&SchemaRegistry::builtin());
            println!("{}", serde_json::to_string_pretty(&descriptor)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Serve => {
            let engine = build_engine(&config).await?;
            let stdin = tokio::io::BufReader::new(tokio::io::stdin());
            plugin::serve(&engine, stdin, tokio::io::stdout(), cancel).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Query {
            table,
            columns,
            filters,
        } => {
            let engine = build_engine(&config).await?;
            let mut request = QueryRequest::new(table).columns(columns);
            request.quals = filters;
            run_single_query(&engine, request, cancel).await
        }
    }
}

async fn build_engine(config: &Config) -> Result<HydrationEngine> {
    let credentials = GcpCredentials::new()
        .await
        .context("Failed to load GCP credentials")?;
    let client = GcpClient::new(
        Arc::new(credentials),
        config.endpoints.clone(),
        config.request_timeout(),
    )?;

    let scopes: Arc<dyn ScopeEnumerator> = if config.projects.is_empty() {
        tracing::info!("No projects configured, discovering");
        Arc::new(ProjectEnumerator::new(
            client.clone(),
            RetryPolicy::from(&config.retry),
        ))
    } else {
        tracing::info!("Using projects: {:?}", config.projects);
        Arc::new(StaticScopes::new(config.projects.iter().cloned()))
    };

    Ok(HydrationEngine::new(
        config,
        SchemaRegistry::builtin(),
        Arc::new(client),
        scopes,
    ))
}

async fn run_single_query(
    engine: &HydrationEngine,
    request: QueryRequest,
    cancel: CancellationToken,
) -> Result<ExitCode> {
    let (rows, status) = engine.collect(request, cancel).await;

    for row in &rows {
        println!("{}", serde_json::to_string(&row.to_json())?);
        for d in &row.diagnostics {
            eprintln!("warning: {} {}: {} ({})", d.scope, row.item_id, d.message, d.kind);
        }
    }
    for w in status.warnings() {
        eprintln!("warning: {} in {}: {} ({})", w.resource_kind, w.scope, w.message, w.kind);
    }

    match status {
        QueryStatus::Done { rows, .. } => {
            eprintln!("{rows} row(s)");
            Ok(ExitCode::SUCCESS)
        }
        QueryStatus::Failed { error, rows, .. } => {
            eprintln!("Query failed after {rows} row(s): {error} ({})", error.kind());
            Ok(ExitCode::FAILURE)
        }
    }
}
