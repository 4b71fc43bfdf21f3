//! Storyshot worker
//!
//! Serves the run protocol on stdin/stdout until stdin closes. Logs go to
//! stderr.
//!
//! # Configuration
//!
//! Same layers as the CLI: `--config` (or `./storyshot.toml`), then
//! `STORYSHOT_*` environment variables. A controller can change anything
//! later with `setConfig` or per run with `run` params.

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use storyshot::config::{Config, PartialConfig};
use storyshot::engine::ExitCode;
use storyshot::rpc::{ConfiguredCollaborators, Transport, TransportConfig, WorkerService};

#[derive(Parser)]
#[command(name = "storyshot-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "JSON-RPC worker for storyshot runs, spoken to over stdio")]
struct Cli {
    /// Config file
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    let config = match Config::load_layered(cli.config.as_deref(), PartialConfig::default()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("storyshot-worker: {}", e);
            return ExitCode::ConfigError.into();
        }
    };

    if let Err(e) = storyshot::logging::init(&config.log_level, config.log_format) {
        eprintln!("storyshot-worker: logging disabled: {}", e);
    }

    tracing::info!(
        snapshots = ?config.snapshot_dir,
        results = ?config.results_dir,
        "Starting worker v{}",
        env!("CARGO_PKG_VERSION")
    );

    let transport = Transport::new(
        tokio::io::stdin(),
        tokio::io::stdout(),
        TransportConfig {
            request_timeout: config.request_timeout(),
        },
    );
    let service = WorkerService::new(transport, config, Arc::new(ConfiguredCollaborators));

    match service.serve().await {
        Ok(()) => ExitCode::Success.into(),
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            ExitCode::RuntimeError.into()
        }
    }
}
