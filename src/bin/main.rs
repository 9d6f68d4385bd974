//! sqlbridge CLI - Run SQL against an out-of-process worker
//!
//! Usage:
//!   sqlbridge query <sql> [--db <path>] [--worker <path>]
//!   sqlbridge check [--db <path>] [--worker <path>]
//!
//! Examples:
//!   sqlbridge query "select 1 as val" --db ./data/app.db --worker ./sqlbridge-worker
//!   sqlbridge query "select * from users" --json
//!   sqlbridge check

use clap::{Parser, Subcommand};
use sqlbridge::config::{DbOpts, Settings};
use sqlbridge::events::{DbEvent, EventSink, NullSink};
use sqlbridge::manager::DbManager;
use sqlbridge::worker::WorkerResponse;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "sqlbridge")]
#[command(about = "sqlbridge - Run SQL against an out-of-process worker")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a config file (otherwise searched in standard locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Location of the data file to open (overrides config)
    #[arg(long, global = true)]
    db: Option<String>,

    /// Path to the worker binary (overrides config)
    #[arg(short, long, global = true)]
    worker: Option<PathBuf>,

    /// Per-request timeout in seconds (overrides config)
    #[arg(short, long, global = true)]
    timeout: Option<u64>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a SQL statement and print the rows
    Query {
        /// The SQL to execute
        sql: String,

        /// Print rows as a JSON array of column/value objects
        #[arg(short, long)]
        json: bool,

        /// Print the emitted lifecycle and query events to stderr
        #[arg(short, long)]
        events: bool,
    },

    /// Spawn the worker, open the database, and report readiness
    Check,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();

    let opts = match build_opts(&cli) {
        Ok(opts) => opts,
        Err(message) => {
            eprintln!("Error: {}", message);
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Commands::Query { sql, json, events } => cmd_query(opts, sql, json, events).await,
        Commands::Check => cmd_check(opts).await,
    }
}

/// Merge config file settings with command-line overrides.
fn build_opts(cli: &Cli) -> Result<DbOpts, String> {
    let settings = match &cli.config {
        Some(path) => Settings::from_file(path).map_err(|e| e.to_string())?,
        None => Settings::load().map_err(|e| e.to_string())?,
    };

    let data_url = match &cli.db {
        Some(url) => url.clone(),
        None => settings.data_url().map_err(|e| e.to_string())?,
    };

    let worker_path = cli
        .worker
        .clone()
        .or_else(|| settings.worker_path())
        .ok_or("no worker binary found; pass --worker or set worker.path in the config")?;

    let timeout_secs = cli.timeout.unwrap_or(settings.worker.request_timeout_secs);

    Ok(DbOpts::new(data_url, worker_path)
        .with_args(settings.worker.args.clone())
        .with_request_timeout(Duration::from_secs(timeout_secs)))
}

async fn cmd_query(opts: DbOpts, sql: String, json: bool, events: bool) -> ExitCode {
    // Captured events are drained and printed after the query settles.
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let sink: Arc<dyn EventSink> = if events {
        Arc::new(event_tx)
    } else {
        Arc::new(NullSink)
    };

    let manager = match DbManager::spawn(opts, sink).await {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error spawning worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let outcome = manager.exec(sql).await;

    if let Err(e) = manager.terminate().await {
        eprintln!("Warning: shutdown failed: {}", e);
    }

    if events {
        while let Ok(event) = event_rx.try_recv() {
            print_event(&event);
        }
    }

    match outcome {
        Ok(WorkerResponse::Result { results, .. }) => {
            if json {
                let objects: Vec<_> = results.iter().map(|rows| rows.to_objects()).collect();
                match serde_json::to_string_pretty(&objects) {
                    Ok(body) => println!("{}", body),
                    Err(e) => {
                        eprintln!("Error encoding rows: {}", e);
                        return ExitCode::FAILURE;
                    }
                }
            } else {
                for rows in &results {
                    println!("{}", rows.columns.join("\t"));
                    for row in &rows.values {
                        let cells: Vec<String> = row.iter().map(render_cell).collect();
                        println!("{}", cells.join("\t"));
                    }
                }
            }
            ExitCode::SUCCESS
        }
        Ok(WorkerResponse::Error { message, .. }) => {
            eprintln!("Query error: {}", message);
            ExitCode::FAILURE
        }
        Ok(WorkerResponse::Abort { .. }) => {
            eprintln!("Query aborted");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_check(opts: DbOpts) -> ExitCode {
    let data_url = opts.data_url.clone();
    let worker_path = opts.worker_path.clone();

    let manager = match DbManager::spawn(opts, Arc::new(NullSink)).await {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("Error spawning worker: {}", e);
            return ExitCode::FAILURE;
        }
    };

    match manager.handle().await {
        Ok(_) => {
            println!(
                "OK: worker '{}' opened '{}'",
                worker_path.display(),
                data_url
            );
            if let Err(e) = manager.terminate().await {
                eprintln!("Warning: shutdown failed: {}", e);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Initialization failed: {}", e);
            ExitCode::FAILURE
        }
    }
}

fn print_event(event: &DbEvent) {
    match serde_json::to_string(event) {
        Ok(line) => eprintln!("{}", line),
        Err(e) => eprintln!("Error encoding event '{}': {}", event.name(), e),
    }
}

/// Render one JSON cell the way SQLite shells do: bare scalars, empty
/// string for null.
fn render_cell(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Null => String::new(),
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
