use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod baratron;
mod config;
mod diagnostics;
mod error;
mod exporter;
mod hippo;
mod listener;
mod recorder;
mod retry;
mod sample;
mod storage;
#[cfg(test)]
mod testutil;

use config::AppConfig;
use listener::CommandListener;
use recorder::SessionController;

#[derive(Debug, Parser)]
#[command(name = "pressure_recorder", about = "Baratron/HIPPO pressure recorder")]
struct Cli {
    /// TOML config file; the built-in defaults are used when omitted
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Cmd>,
}

#[derive(Debug, Subcommand)]
enum Cmd {
    /// Wait for Begin/End commands and record runs
    Record,
    /// Convert a run file to CSV
    Export {
        run_file: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = match &cli.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_default()?,
    };

    match cli.command.unwrap_or(Cmd::Record) {
        Cmd::Record => record(config).await,
        Cmd::Export { run_file, output } => {
            let output = output.unwrap_or_else(|| exporter::default_output_path(&run_file));
            let manifest = exporter::export_run(&run_file, &output).await?;
            info!("wrote {} samples to {}", manifest.num_records, manifest.output.display());
            Ok(())
        }
    }
}

async fn record(config: AppConfig) -> Result<()> {
    info!("Starting pressure_recorder");

    let config = Arc::new(config);
    let controller = Arc::new(SessionController::new(config.clone()));
    let listener = CommandListener::bind(&config.listener, controller.clone()).await?;
    info!("Readout listener starting up on {}", listener.local_addr()?);

    tokio::select! {
        res = listener.run() => res?,
        _ = tokio::signal::ctrl_c() => info!("interrupted"),
    }

    if let Some(summary) = controller.shutdown().await {
        info!("run {} closed with {} samples", summary.run_number, summary.samples);
        if let Some(reason) = summary.aborted {
            eprintln!("Run {} had aborted: {}", summary.run_number, reason);
        }
    }

    Ok(())
}
