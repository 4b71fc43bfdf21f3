//! Storyshot CLI
//!
//! - `test`: discover, filter, capture and compare, print a summary
//! - `cleanup`: repair the snapshot and results indexes
//! - `list`: print the subjects a run would cover
//! - `config`: emit a default config file

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storyshot::capture::Capturer;
use storyshot::catalog::{CatalogSource, HttpCatalog, Subject};
use storyshot::config::{generate_default_config, Config, ConfigError, LogFormat, PartialConfig};
use storyshot::engine::{Engine, EngineEvent, ExitCode, RunSummary, SubjectResult};
use storyshot::index::{CleanupOptions, Reconciler, ResultStatus, ResultsIndex, SnapshotIndex};
use storyshot::rpc::{ClientConfig, RpcClient, WorkerCommand};
use tokio::sync::mpsc;

#[derive(Parser)]
#[command(name = "storyshot")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Visual regression testing for component stories")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: ./storyshot.toml, then the user config dir)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log format (pretty, json)
    #[arg(long, global = true)]
    log_format: Option<LogFormat>,

    /// Storybook base URL
    #[arg(long, global = true)]
    storybook_url: Option<String>,
}

#[derive(Args, Default)]
struct FilterArgs {
    /// Only subjects matching this glob (repeatable)
    #[arg(short, long)]
    include: Vec<String>,

    /// Skip subjects matching this glob (repeatable)
    #[arg(short, long)]
    exclude: Vec<String>,

    /// Only subjects whose key or name matches this regex
    #[arg(short, long)]
    grep: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture every subject and compare against its baseline
    Test {
        #[command(flatten)]
        filter: FilterArgs,

        /// Subjects captured at once
        #[arg(short = 'j', long)]
        concurrency: Option<usize>,

        /// Stop after this many failures (0 = never)
        #[arg(long)]
        max_failures: Option<usize>,

        #[arg(long)]
        browser: Option<String>,

        #[arg(long)]
        viewport: Option<String>,

        /// Overwrite baselines with the new captures
        #[arg(short, long)]
        update_baselines: bool,

        /// Capture program invoked once per subject
        #[arg(long)]
        capture_command: Option<String>,

        /// Run through a storyshot-worker process instead of in-process
        #[arg(long)]
        worker: Option<PathBuf>,
    },

    /// Remove index entries and files that no longer belong
    Cleanup {
        /// Entries whose files are gone, and files no entry references
        #[arg(long)]
        orphans: bool,

        /// Entries that share a subject
        #[arg(long)]
        duplicates: bool,

        /// Entries for subjects no longer in the catalog
        #[arg(long)]
        stale: bool,

        /// Every pass (the default when none is chosen)
        #[arg(long)]
        all: bool,

        /// Treat browser and viewport as part of an entry's identity when
        /// collapsing duplicates
        #[arg(long)]
        by_configuration: bool,
    },

    /// Print the subjects a run would cover
    List {
        #[command(flatten)]
        filter: FilterArgs,
    },

    /// Print a default config file
    Config {
        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn non_empty<T>(values: Vec<T>) -> Option<Vec<T>> {
    (!values.is_empty()).then_some(values)
}

impl Cli {
    /// Flags that override config file and environment
    fn overrides(&self) -> PartialConfig {
        let mut overrides = PartialConfig {
            storybook_url: self.storybook_url.clone(),
            log_level: self.log_level.clone(),
            log_format: self.log_format,
            ..Default::default()
        };

        let filter = match &self.command {
            Commands::Test {
                filter,
                concurrency,
                max_failures,
                browser,
                viewport,
                update_baselines,
                capture_command,
                ..
            } => {
                overrides.concurrency = *concurrency;
                overrides.max_failures = *max_failures;
                overrides.browser = browser.clone().map(Some);
                overrides.viewport = viewport.clone().map(Some);
                overrides.update_baselines = update_baselines.then_some(true);
                overrides.capture_command = capture_command.clone().map(Some);
                Some(filter)
            }
            Commands::List { filter } => Some(filter),
            _ => None,
        };

        if let Some(filter) = filter {
            overrides.include = non_empty(filter.include.clone());
            overrides.exclude = non_empty(filter.exclude.clone());
            overrides.grep = filter.grep.clone().map(Some);
        }

        overrides
    }
}

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();

    if let Commands::Config { output } = &cli.command {
        return match write_default_config(output.as_deref()) {
            Ok(()) => ExitCode::Success.into(),
            Err(e) => {
                eprintln!("error: {:#}", e);
                ExitCode::RuntimeError.into()
            }
        };
    }

    let config = match Config::load_layered(cli.config.as_deref(), cli.overrides()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("error: {}", e);
            return ExitCode::ConfigError.into();
        }
    };

    if let Err(e) = storyshot::logging::init(&config.log_level, config.log_format) {
        eprintln!("warning: logging disabled: {}", e);
    }
    tracing::debug!("Storyshot v{}", env!("CARGO_PKG_VERSION"));

    let result = match cli.command {
        Commands::Test { worker: Some(worker), .. } => test_via_worker(&worker, cli.config.as_deref(), &config).await,
        Commands::Test { .. } => test(&config).await,
        Commands::Cleanup {
            orphans,
            duplicates,
            stale,
            all,
            by_configuration,
        } => {
            let options = if all {
                CleanupOptions {
                    by_configuration,
                    ..CleanupOptions::all()
                }
            } else {
                CleanupOptions {
                    orphans,
                    duplicates,
                    stale,
                    by_configuration,
                }
            };
            cleanup(&config, options).await
        }
        Commands::List { .. } => list(&config).await,
        Commands::Config { .. } => Ok(ExitCode::Success),
    };

    match result {
        Ok(code) => code.into(),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("error: {:#}", e);
            exit_code_for(&e).into()
        }
    }
}

fn exit_code_for(error: &anyhow::Error) -> ExitCode {
    if error.downcast_ref::<ConfigError>().is_some() {
        ExitCode::ConfigError
    } else {
        ExitCode::RuntimeError
    }
}

fn write_default_config(output: Option<&Path>) -> anyhow::Result<()> {
    let contents = generate_default_config();
    match output {
        Some(path) => {
            std::fs::write(path, contents).with_context(|| format!("writing {}", path.display()))?;
            eprintln!("Wrote {}", path.display());
        }
        None => print!("{}", contents),
    }
    Ok(())
}

async fn discover(config: &Config) -> anyhow::Result<Vec<Subject>> {
    let catalog = HttpCatalog::new(config.catalog_config())?;
    let subjects = catalog.discover().await?;
    let filtered = config.subject_filter()?.apply(subjects);
    tracing::info!(subjects = filtered.len(), url = %config.storybook_url, "Discovered subjects");
    Ok(filtered)
}

async fn open_stores(config: &Config) -> anyhow::Result<(Arc<SnapshotIndex>, Arc<ResultsIndex>)> {
    let snapshots = SnapshotIndex::open(config.snapshot_dir.clone(), config.snapshot_store_config())
        .await
        .with_context(|| format!("opening snapshot index in {}", config.snapshot_dir.display()))?;
    let results = ResultsIndex::open(config.results_dir.clone(), config.results_store_config())
        .await
        .with_context(|| format!("opening results index in {}", config.results_dir.display()))?;
    Ok((Arc::new(snapshots), Arc::new(results)))
}

fn print_result(result: &SubjectResult) {
    let label = match result.status {
        ResultStatus::Passed => "PASS",
        ResultStatus::Failed => "FAIL",
        ResultStatus::New => "NEW ",
        ResultStatus::Missing => "MISS",
    };
    let detail = match (&result.error, result.diff_pixels) {
        (Some(error), _) => format!(" ({})", error),
        (None, Some(pixels)) if pixels > 0 => format!(" ({} px differ)", pixels),
        _ => String::new(),
    };
    println!("{} {} [{} ms]{}", label, result.display_name, result.duration_ms, detail);
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("{}", summary);
    if summary.stopped_early {
        println!("Stopped early: failure limit reached");
    }
}

async fn test(config: &Config) -> anyhow::Result<ExitCode> {
    let capturer: Arc<dyn Capturer> = Arc::new(config.capturer().ok_or_else(|| ConfigError::Invalid {
        field: "captureCommand".to_string(),
        reason: "not set".to_string(),
    })?);

    let subjects = discover(config).await?;
    let (snapshots, results) = open_stores(config).await?;

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let engine = Engine::new(snapshots, results, capturer).with_events(events_tx);

    let cancel = engine.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, finishing subjects in flight");
            cancel.cancel();
        }
    });

    let printer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match event {
                EngineEvent::SubjectCompleted(result) => print_result(&result),
                EngineEvent::Log(message) => tracing::info!("{}", message),
                _ => {}
            }
        }
    });

    let summary = engine.run_all(subjects, config.run_options()).await;
    drop(engine);
    let _ = printer.await;

    let summary = summary?;
    print_summary(&summary);
    Ok(ExitCode::from_summary(&summary))
}

/// Same run, driven through a worker process over JSON-RPC
async fn test_via_worker(worker: &Path, config_file: Option<&Path>, config: &Config) -> anyhow::Result<ExitCode> {
    let mut command = WorkerCommand::new(worker.to_string_lossy());
    if let Some(path) = config_file {
        command = command.arg("--config").arg(path.to_string_lossy());
    }

    let mut client = RpcClient::new(ClientConfig {
        request_timeout: config.request_timeout(),
        ..Default::default()
    });
    client.start(&command).await.context("starting worker")?;

    let (done_tx, mut done_rx) = mpsc::unbounded_channel();
    client
        .on_notification("storyComplete", |n| {
            let result = n
                .params
                .and_then(|p| p.get("result").cloned())
                .and_then(|r| serde_json::from_value::<SubjectResult>(r).ok());
            if let Some(result) = result {
                print_result(&result);
            }
        })
        .await?;
    client
        .on_notification("error", |n| {
            if let Some(message) = n.params.as_ref().and_then(|p| p.get("message")).and_then(Value::as_str) {
                eprintln!("worker error: {}", message);
            }
        })
        .await?;
    client
        .on_notification("complete", move |n| {
            let code = n
                .params
                .as_ref()
                .and_then(|p| p.get("code"))
                .and_then(Value::as_i64)
                .and_then(|c| ExitCode::try_from(c as i32).ok())
                .unwrap_or(ExitCode::RuntimeError);
            let _ = done_tx.send(code);
        })
        .await?;

    // The worker already layered file and environment; send the merged result
    let overrides: PartialConfig = serde_json::from_value(serde_json::to_value(config)?)?;
    client.run(&overrides).await?;

    let code = tokio::select! {
        code = done_rx.recv() => code.unwrap_or(ExitCode::RuntimeError),
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted, cancelling worker run");
            client.cancel().await?;
            done_rx.recv().await.unwrap_or(ExitCode::RuntimeError)
        }
        _ = client.closed() => anyhow::bail!("worker exited during the run"),
    };

    if let Some(summary) = client.get_results().await? {
        print_summary(&summary);
    }
    client.shutdown().await;
    Ok(code)
}

async fn cleanup(config: &Config, options: CleanupOptions) -> anyhow::Result<ExitCode> {
    let options = options.resolved();

    let valid_keys: Option<HashSet<String>> = if options.stale {
        let catalog = HttpCatalog::new(config.catalog_config())?;
        Some(catalog.discover().await?.into_iter().map(|s| s.key).collect())
    } else {
        None
    };

    let (snapshots, results) = open_stores(config).await?;
    let snapshot_report = Reconciler::new(Arc::clone(&snapshots))
        .run(options, valid_keys.as_ref())
        .await;
    let results_report = Reconciler::new(Arc::clone(&results))
        .run(options, valid_keys.as_ref())
        .await;

    snapshots.flush().await?;
    results.flush().await?;

    println!("snapshots: {}", snapshot_report);
    println!("results:   {}", results_report);
    Ok(ExitCode::Success)
}

async fn list(config: &Config) -> anyhow::Result<ExitCode> {
    let subjects = discover(config).await?;
    for subject in &subjects {
        println!("{}\t{}", subject.key, subject.display_name());
    }
    eprintln!("{} subjects", subjects.len());
    Ok(ExitCode::Success)
}
