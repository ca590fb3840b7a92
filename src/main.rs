//! ImageIntact CLI — drives a `BackupCoordinator` run from the command
//! line and exposes session reporting/export over the durable event log.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use imageintact_core::config::{Config, FileTypeFilter};
use imageintact_core::coordinator::{BackupCoordinator, DestinationSpec, SessionOutcome};
use imageintact_core::eventlog::EventLogger;
use imageintact_core::fileops::FileOps;
use imageintact_core::queue::DestinationClass;
use imageintact_core::retry::RetryPolicy;
use imageintact_core::scanner::ScanOptions;
use imageintact_core::shutdown;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "imageintact", author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML configuration file; CLI flags override its values.
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides config/log.level.
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replicate a source tree to one or more destinations.
    Backup {
        /// Source tree to back up.
        #[arg(long)]
        source: PathBuf,

        /// A destination, as `name=path`; repeat for multiple destinations.
        #[arg(long = "destination", value_parser = parse_destination)]
        destinations: Vec<(String, PathBuf)>,

        /// Destination subfolder for this run (may embed a timestamp).
        #[arg(long)]
        organization_name: Option<String>,

        /// Disable recursion into subdirectories (default: recurse).
        #[arg(long)]
        no_subdirectories: bool,

        /// Skip photo-library cache subpaths (Cache/, Proxies/, Thumbnails/).
        #[arg(long)]
        exclude_cache_files: bool,

        /// Restrict the scan to one file-type class.
        #[arg(long, value_enum)]
        file_type_filter: Option<FileTypeFilter>,

        /// Skip files that already exist at a destination with identical content.
        #[arg(long)]
        skip_exact_duplicates: bool,

        /// Skip files whose content exists at a destination under a different name.
        #[arg(long)]
        skip_renamed_duplicates: bool,

        /// Maximum retry attempts for a transient file-level error.
        #[arg(long)]
        max_retries: Option<u32>,

        /// Per-operation I/O timeout, in seconds.
        #[arg(long)]
        io_timeout_seconds: Option<u64>,

        /// Ask the host to prevent system sleep for the duration of the run.
        #[arg(long)]
        prevent_sleep: bool,
    },
    /// Print a diffable text report for a prior session.
    Report {
        /// Session id to report on.
        session_id: String,
    },
    /// Export a prior session as JSON to stdout.
    Export {
        /// Session id to export.
        session_id: String,
    },
}

fn parse_destination(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !name.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => {
            let path = PathBuf::from(raw);
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| raw.to_string());
            Ok((name, path))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path).context("loading configuration file")?,
        None => Config::default(),
    };

    let log_level = cli.log_level.as_deref().unwrap_or(&config.log.level);
    imageintact_core::logging::init(log_level)?;

    match cli.command {
        Command::Backup {
            source,
            destinations,
            organization_name,
            no_subdirectories,
            exclude_cache_files,
            file_type_filter,
            skip_exact_duplicates,
            skip_renamed_duplicates,
            max_retries,
            io_timeout_seconds,
            prevent_sleep,
        } => {
            run_backup(
                config,
                source,
                destinations,
                organization_name,
                no_subdirectories,
                exclude_cache_files,
                file_type_filter,
                skip_exact_duplicates,
                skip_renamed_duplicates,
                max_retries,
                io_timeout_seconds,
                prevent_sleep,
            )
            .await
        }
        Command::Report { session_id } => run_report(&config, &session_id),
        Command::Export { session_id } => run_export(&config, &session_id),
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_backup(
    config: Config,
    source: PathBuf,
    destinations: Vec<(String, PathBuf)>,
    organization_name: Option<String>,
    no_subdirectories: bool,
    exclude_cache_files: bool,
    file_type_filter: Option<FileTypeFilter>,
    skip_exact_duplicates: bool,
    skip_renamed_duplicates: bool,
    max_retries: Option<u32>,
    io_timeout_seconds: Option<u64>,
    prevent_sleep: bool,
) -> Result<()> {
    if destinations.is_empty() {
        anyhow::bail!("at least one --destination is required");
    }

    let organization_name = organization_name.unwrap_or(config.destination.organization_name);
    let fileops = Arc::new(FileOps::new(Duration::from_secs(
        io_timeout_seconds.unwrap_or(config.retry.io_timeout_seconds),
    )));

    let mut retry = RetryPolicy {
        max_attempts: max_retries.unwrap_or(config.retry.max_retries),
        base_delay: Duration::from_millis(config.retry.retry_base_ms),
        max_delay: Duration::from_millis(config.retry.retry_cap_ms),
    };
    if retry.max_attempts == 0 {
        retry.max_attempts = 1;
    }

    let destination_specs = destinations
        .into_iter()
        .map(|(name, root)| {
            let network_destination = fileops.is_network_volume(&root);
            let class = if network_destination {
                DestinationClass::Network
            } else {
                DestinationClass::Local
            };
            let worker_count = match class {
                DestinationClass::Local => config.destination.local_workers,
                DestinationClass::External => config.destination.external_workers,
                DestinationClass::Network => config.destination.network_workers,
            };
            DestinationSpec {
                name,
                root,
                organization_name: organization_name.clone(),
                class,
                worker_count,
                network_destination,
            }
        })
        .collect();

    let eventlog = EventLogger::open(&config.eventlog.db_path)
        .map(Some)
        .unwrap_or_else(|e| {
            tracing::error!("failed to open event log at {:?}: {}", config.eventlog.db_path, e);
            None
        });

    let scan_options = ScanOptions {
        include_subdirectories: !no_subdirectories && config.scan.include_subdirectories,
        exclude_cache_files: exclude_cache_files || config.scan.exclude_cache_files,
        file_type_filter: file_type_filter.unwrap_or(config.scan.file_type_filter),
        max_depth: config.scan.max_depth,
    };

    let coordinator = BackupCoordinator::new(
        source,
        destination_specs,
        scan_options,
        config.duplicate.scan_depth,
        skip_exact_duplicates || config.duplicate.skip_exact_duplicates,
        skip_renamed_duplicates || config.duplicate.skip_renamed_duplicates,
        fileops,
        retry,
        eventlog,
        env!("CARGO_PKG_VERSION"),
        prevent_sleep || config.power.prevent_sleep,
    )?;

    shutdown::install(coordinator.cancel_token());

    let outcome = coordinator.run().await?;

    tracing::info!(
        "session {} finished: {:?}{}",
        outcome.session_id,
        outcome.outcome,
        outcome
            .warning
            .as_ref()
            .map(|w| format!(" ({w})"))
            .unwrap_or_default()
    );

    for destination in &outcome.destinations {
        let failed = destination
            .results
            .iter()
            .filter(|r| matches!(r.outcome, imageintact_core::queue::FileOutcome::Failed(_)))
            .count();
        tracing::info!(
            "destination '{}': {} files, {} failed",
            destination.name,
            destination.results.len(),
            failed
        );
    }

    match outcome.outcome {
        SessionOutcome::Failed => std::process::exit(1),
        SessionOutcome::Cancelled => std::process::exit(130),
        _ => Ok(()),
    }
}

fn run_report(config: &Config, session_id: &str) -> Result<()> {
    let logger = EventLogger::open(&config.eventlog.db_path).context("opening event log")?;
    let report = logger
        .generate_report(session_id)
        .context("generating session report")?;
    println!("{report}");
    Ok(())
}

fn run_export(config: &Config, session_id: &str) -> Result<()> {
    let logger = EventLogger::open(&config.eventlog.db_path).context("opening event log")?;
    let export = logger
        .export_json(session_id)
        .context("exporting session")?;
    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}
