use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use toll_core::{ProcessCsvDataRequest, ProcessCsvFileRequest, ValidateCsvDataRequest};
use toll_ingest::{CancelSignal, IngestConfig, IngestService};
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "toll-cli")]
#[command(about = "Toll transaction CSV ingest")]
struct Cli {
    /// YAML config file; environment variables are used when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP service.
    Serve,
    /// Process a CSV file, or the latest one under CSV_BASE_PATH when no path is given.
    ProcessFile {
        path: Option<PathBuf>,
        #[arg(long, default_value = "")]
        account_id: String,
    },
    /// Submit a file's contents as inline CSV data.
    ProcessData {
        path: PathBuf,
        #[arg(long, default_value = "")]
        account_id: String,
    },
    /// Validate a CSV file without saving anything.
    Validate { path: PathBuf },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => IngestConfig::from_yaml_file(path)?,
        None => IngestConfig::from_env(),
    };
    let service = IngestService::from_config(config)?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => toll_web::serve(service).await?,
        Commands::ProcessFile { path, account_id } => {
            let req = ProcessCsvFileRequest {
                csv_file_path: path.map(|p| p.display().to_string()).unwrap_or_default(),
                account_id,
            };
            let cancel = ctrl_c_signal();
            let resp = service.process_csv_file(Some(&req), &cancel).await?;
            print_json(&resp)?;
        }
        Commands::ProcessData { path, account_id } => {
            let req = ProcessCsvDataRequest {
                csv_data: read_csv(&path)?,
                account_id,
            };
            let cancel = ctrl_c_signal();
            let resp = service.process_csv_data(Some(&req), &cancel).await?;
            print_json(&resp)?;
        }
        Commands::Validate { path } => {
            let req = ValidateCsvDataRequest {
                csv_data: read_csv(&path)?,
                account_id: String::new(),
            };
            let resp = service.validate_csv_data(Some(&req))?;
            print_json(&resp)?;
        }
    }

    Ok(())
}

/// Flips to cancelled on the first Ctrl-C; the batch stops at the next record.
fn ctrl_c_signal() -> CancelSignal {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling batch");
            let _ = tx.send(true);
        }
    });
    CancelSignal::from_watch(rx)
}

fn read_csv(path: &Path) -> Result<String> {
    std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!(
        "{}",
        serde_json::to_string_pretty(value).context("serializing response")?
    );
    Ok(())
}
