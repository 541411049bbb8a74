//! syncq CLI: mirror a source directory into a destination directory.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use syncq::config::Config;
use syncq::destination::{LocalDestination, LocalSource, SourceFile};
use syncq::engine::SyncQueue;
use syncq::task::Task;
use syncq::telemetry::{TelemetryConfig, init_telemetry};
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "syncq", about = "Mirror a directory tree with a prioritized worker pool")]
struct Cli {
    /// Directory to copy from
    source: PathBuf,
    /// Directory to copy into (created if missing)
    dest: PathBuf,
    /// Concurrent store workers
    #[arg(long)]
    workers: Option<usize>,
    /// Overwrite changed files without asking
    #[arg(short = 'y', long)]
    yes: bool,
    /// Show what would happen without copying or deleting
    #[arg(long)]
    dry_run: bool,
    /// Delete destination files that are not in the source
    #[arg(long)]
    delete: bool,
    /// Extra passes over failed copies
    #[arg(long)]
    retries: Option<u32>,
    /// TOML config file with a [sync] table
    #[arg(long)]
    config: Option<PathBuf>,
    /// Print the final report as JSON
    #[arg(long)]
    json: bool,
}

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(workers) = cli.workers {
        config.store_workers = workers;
    }
    if let Some(retries) = cli.retries {
        config.retries = retries;
    }
    config.assume_yes |= cli.yes;
    config.dry_run |= cli.dry_run;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "syncq".to_string(),
        log_level: config.log_level.clone(),
    })?;

    if !cli.source.is_dir() {
        anyhow::bail!("source {} is not a directory", cli.source.display());
    }

    let dst = Arc::new(LocalDestination::open(&cli.dest)?);
    let queue = SyncQueue::new(dst.clone(), config.sync_options()?)?;
    queue.start()?;

    let sources = LocalSource::scan(&cli.source)?;
    let names: BTreeSet<String> = sources.iter().map(|s| s.name().to_string()).collect();
    info!(files = sources.len(), source = %cli.source.display(), "scanned source");
    for src in sources {
        queue.store(Arc::new(src))?;
    }

    if cli.delete {
        for name in dst.list_files()? {
            if !names.contains(&name) {
                queue.delete_name(&name)?;
            }
        }
    }

    queue.wait_for_finish();

    let mut round = 0;
    while queue.has_errors() && round < config.retries {
        if !queue.has_retryable_errors() {
            break;
        }
        round += 1;
        let requeued = queue.requeue_errors()?;
        warn!(round, requeued, "retrying failed tasks");
        queue.wait_for_finish();
    }

    let errors = queue.errors();
    let report = queue.report();
    queue.shutdown()?;

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    }

    if !errors.is_empty() {
        for record in &errors {
            error!(
                task = %record.task.description(),
                error = record.error.as_deref().unwrap_or("-"),
                "task failed"
            );
        }
        anyhow::bail!("{} task(s) failed", errors.len());
    }

    Ok(())
}
