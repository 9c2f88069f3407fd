//! chainflow service binary.
//!
//! Runs the ingestion engine with its HTTP control plane, plus small
//! operational subcommands for inspecting and initializing the store.

use anyhow::{Context, Result};
use chainflow_api::server;
use chainflow_collector::rpc::ChainClients;
use chainflow_collector::{Config, Storage, Supervisor};
use chainflow_core::ChainId;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tracing::info;

#[derive(Parser)]
#[command(name = "chainflow")]
#[command(version, about = "Dual-chain ingestion engine with an HTTP control plane", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "chainflow.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine and control-plane server
    Run,

    /// Show cursors and record counts
    Status,

    /// Initialize the database
    InitDb,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    init_logging(cli.debug)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_service(&cli.config).await?,
        Commands::Status => show_status(&cli.config).await?,
        Commands::InitDb => init_database(&cli.config).await?,
    }

    Ok(())
}

/// Initialize tracing subscriber for logging
fn init_logging(debug: bool) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter = if debug {
        EnvFilter::new("chainflow_api=debug,chainflow_collector=debug,tower_http=debug,sqlx=warn")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("chainflow_api=info,chainflow_collector=info,tower_http=info")
        })
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_target(true))
        .init();

    Ok(())
}

async fn load_config(path: &str) -> Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        info!("config file {} not found, using defaults", path);
        Ok(Config::default())
    }
}

async fn open_storage(config: &Config) -> Result<Storage> {
    let storage = Storage::new(
        &config.database.url,
        Some(config.database.max_connections),
        Some(config.database.min_connections),
    )
    .await
    .context("Failed to connect to database")?;

    storage
        .run_migrations()
        .await
        .context("Failed to run migrations")?;

    Ok(storage)
}

/// Main service: engine supervisor plus the control-plane server.
async fn run_service(config_path: &str) -> Result<()> {
    info!("chainflow starting, version {}", env!("CARGO_PKG_VERSION"));

    let config = load_config(config_path).await?;
    let storage = open_storage(&config).await?;

    let clients = ChainClients::from_config(&config).context("Failed to build RPC clients")?;
    let port = config.server.port;

    let supervisor = Arc::new(Supervisor::new(config, storage, clients));
    supervisor
        .preload_cursors()
        .await
        .context("Failed to preload cursors")?;

    server::run_with_config(supervisor, port).await
}

/// Show cursors and record counts.
async fn show_status(config_path: &str) -> Result<()> {
    let config = load_config(config_path).await?;
    let storage = open_storage(&config).await?;

    println!("\n=== chainflow status ===\n");

    for chain in ChainId::all() {
        let stats = storage.chain_stats(chain).await?;
        println!("{}:", chain);
        match storage.load_cursor(chain).await? {
            Some(cursor) => {
                println!("  Cursor: {} (mode: {})", cursor.position, cursor.mode);
                println!(
                    "  Last advance: {}",
                    chrono::DateTime::from_timestamp(cursor.updated_at, 0)
                        .map(|dt| dt.to_rfc3339())
                        .unwrap_or_else(|| "unknown".to_string())
                );
            }
            None => println!("  Cursor: none (never collected)"),
        }
        println!("  Blocks: {}", stats.blocks);
        println!("  Transactions: {}", stats.txs);
    }

    if let Some(run) = storage.latest_run().await? {
        println!("\nLast run:");
        println!("  Started: {}", run.started_at);
        match (run.stopped_at, run.stop_reason) {
            (Some(stopped), Some(reason)) => {
                println!("  Stopped: {} ({})", stopped, reason);
            }
            _ => println!("  Still open"),
        }
    } else {
        println!("\nNo collection runs recorded.");
    }

    println!();
    storage.close().await;

    Ok(())
}

/// Initialize the database and verify it is usable.
async fn init_database(config_path: &str) -> Result<()> {
    let config = load_config(config_path).await?;
    let storage = open_storage(&config).await?;

    storage
        .health_check()
        .await
        .context("Database health check failed")?;

    info!("database initialized at {}", config.database.url);
    storage.close().await;

    Ok(())
}
