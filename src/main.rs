//! `longitudinal-manager`: the entry point for one dedup run (C1-C9,
//! §4.6). Acquires the single-instance lock, runs bookkeeping prep,
//! enumerates the visits due for processing, and fans them out to
//! worker threads.

use std::process::ExitCode;

use clap::Parser;
use fd_lock::RwLock;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::prelude::*;

use longitudinal::config::{CommandLineArgs, Config};
use longitudinal::error::ManagerError;
use longitudinal::locks::open_lock_file;
use longitudinal::{bookkeeping, db, manager};

/// Returned guard flushes the non-blocking file writer on drop; the
/// caller must hold it for the process lifetime (dropping early
/// silently truncates the log).
fn init_tracing(verbose: u8, config: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let default_level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let registry = tracing_subscriber::registry().with(filter);

    // Production runs keep a rotating on-disk log alongside stdout so
    // a run's output survives the terminal that launched it; dev runs
    // stay stdout-only (§6 `general.in_production`).
    if config.general.in_production {
        let file_appender = tracing_appender::rolling::daily(&config.general.tmp_dir, "longitudinal.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(non_blocking).with_ansi(false))
            .with(tracing_subscriber::fmt::layer())
            .init();
        Some(guard)
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
        None
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    // Load `LONGITUDINAL_*` overrides from a local `.env` if present;
    // a missing file is not an error (§6 "environment variables and a
    // file-system config are equivalent entry points").
    dotenvy::dotenv().ok();

    let args = CommandLineArgs::parse();

    // Configuration must be loaded before the subscriber is installed:
    // whether to log to a file depends on `general.in_production`.
    let config = match Config::load(&args) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("failed to load configuration: {err}");
            return ExitCode::FAILURE;
        },
    };

    let _tracing_guard = init_tracing(args.verbose, &config);

    match run(&args, &config).await {
        Ok(summary) => {
            tracing::info!(attempted = summary.visits_attempted, failed = summary.visits_failed, "run complete");
            if summary.visits_failed > 0 {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            }
        },
        Err(err) => {
            tracing::error!(error = %err, "run aborted");
            ExitCode::FAILURE
        },
    }
}

async fn run(args: &CommandLineArgs, config: &Config) -> Result<manager::RunSummary, ManagerError> {
    // Held for the lifetime of this function; its `Drop` releases the
    // OS advisory lock on return, error, or panic unwind (§4.6, §6).
    let lock_file = open_lock_file(&config.general.tmp_dir)
        .map_err(|source| ManagerError::Lock { path: config.general.tmp_dir.clone(), source })?;
    let mut lock = RwLock::new(lock_file);
    let _guard = lock.try_write().map_err(|source| ManagerError::Lock { path: config.general.tmp_dir.clone(), source })?;

    let warehouse_port = config.longitudinal.warehouse_port;
    let mart_port = config.longitudinal.mart_port;

    let warehouse = db::connect(&config.longitudinal, &args.data_warehouse, warehouse_port).await?;
    let mart = db::connect(&config.longitudinal, &args.data_mart, mart_port).await?;

    if !args.skip_prep {
        let moved = bookkeeping::prep_deduplicate_tables(&warehouse, &mart).await?;
        tracing::info!(moved, "bookkeeping prep complete");
    }

    let date = manager::resolve_date(config, args.date, args.countdown)?;
    let visit_ids = bookkeeping::visits_to_process(&warehouse, &mart, date).await?;

    // Bootstrap pools are dropped before fan-out; each worker thread
    // opens its own pair (§5 "Databases").
    drop(warehouse);
    drop(mart);

    let summary = manager::fan_out(config, &args.data_warehouse, warehouse_port, &args.data_mart, mart_port, visit_ids);

    if let Some(direction) = args.countdown {
        if let Some(date) = date {
            manager::advance_datefile(config, direction, date)?;
        }
    }

    Ok(summary)
}
