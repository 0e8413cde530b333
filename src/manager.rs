//! Manager (C7, §4.6): single-instance lock, bookkeeping prep,
//! visit enumeration, and fan-out to N worker threads that drain a
//! shared work queue.
//!
//! §9 "multiprocessing as the concurrency model": the original forks
//! one OS process per worker because CPython's GIL makes threads
//! useless for CPU-bound fan-out. This build has no such constraint,
//! so each worker is a plain OS thread running its own single-threaded
//! Tokio runtime for its DB calls, sharing nothing with its siblings
//! except the per-dimension locks in [`crate::locks::DimensionLocks`].

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread;

use chrono::{Duration, NaiveDate};
use tracing::{error, info, warn};

use crate::config::{Config, CountdownDirection};
use crate::db;
use crate::error::{ManagerError, WorkerError};
use crate::locks::DimensionLocks;
use crate::worker::{process_visit, WorkerContext};

const DATEFILE_NAME: &str = "longitudinal_datefile";

/// Outcome of one manager run, surfaced to the binary for exit-code
/// and log-summary purposes.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub visits_attempted: usize,
    pub visits_failed: usize,
}

/// Resolve the `admit_datetime` day this run should be scoped to, if
/// any (§4.6 "Date persistence").
///
/// - An explicit `--date` always wins.
/// - `--countdown` with no `--date` reads the persisted cursor.
/// - Neither present: whole-database mode (`None`).
pub fn resolve_date(
    config: &Config,
    explicit_date: Option<NaiveDate>,
    countdown: Option<CountdownDirection>,
) -> Result<Option<NaiveDate>, ManagerError> {
    if explicit_date.is_some() {
        return Ok(explicit_date);
    }
    if countdown.is_some() {
        return Ok(Some(read_datefile(config)?));
    }
    Ok(None)
}

/// Advance or retreat the persisted date cursor after a successful
/// run (§4.6). Only called when `--countdown` was given; `date` is
/// the day that was just processed.
pub fn advance_datefile(config: &Config, direction: CountdownDirection, date: NaiveDate) -> Result<(), ManagerError> {
    let next = match direction {
        CountdownDirection::Forwards => date + Duration::days(1),
        CountdownDirection::Backwards => date - Duration::days(1),
    };
    write_datefile(config, next)
}

fn datefile_path(config: &Config) -> PathBuf {
    PathBuf::from(&config.general.tmp_dir).join(DATEFILE_NAME)
}

fn read_datefile(config: &Config) -> Result<NaiveDate, ManagerError> {
    let path = datefile_path(config);
    let contents = fs::read_to_string(&path)
        .map_err(|source| ManagerError::Datefile { path: path.display().to_string(), source })?;
    NaiveDate::parse_from_str(contents.trim(), "%Y-%m-%d").map_err(|_| ManagerError::NoDateToCountdown {
        path: path.display().to_string(),
    })
}

fn write_datefile(config: &Config, date: NaiveDate) -> Result<(), ManagerError> {
    let path = datefile_path(config);
    fs::write(&path, date.format("%Y-%m-%d").to_string())
        .map_err(|source| ManagerError::Datefile { path: path.display().to_string(), source })
}

/// Run `visit_ids` to completion across `num_workers` threads, each
/// owning its own warehouse/mart pool pair (§4.6 "Fan-out", §5).
///
/// Only spins up more than one worker when there is more than one
/// visit to process, mirroring the original's `if
/// len(visits_to_process) > 1` guard — a single-visit run gets a
/// single thread rather than paying for idle siblings.
pub fn fan_out(
    config: &Config,
    data_warehouse: &str,
    warehouse_port: u16,
    data_mart: &str,
    mart_port: u16,
    visit_ids: Vec<String>,
) -> RunSummary {
    let total = visit_ids.len();
    if total == 0 {
        return RunSummary::default();
    }

    let queue = Arc::new(Mutex::new(VecDeque::from(visit_ids)));
    let locks = DimensionLocks::new();
    let num_workers = if total > 1 { config.longitudinal.num_workers } else { 1 };

    info!(total, num_workers, "fanning out visits to workers");

    let handles: Vec<_> = (0..num_workers)
        .map(|worker_index| {
            let queue = Arc::clone(&queue);
            let locks = locks.clone();
            let longitudinal = config.longitudinal.clone();
            let data_warehouse = data_warehouse.to_string();
            let data_mart = data_mart.to_string();

            thread::Builder::new()
                .name(format!("longitudinal-worker-{worker_index}"))
                .spawn(move || worker_loop(worker_index, longitudinal, data_warehouse, warehouse_port, data_mart, mart_port, locks, queue))
                .expect("failed to spawn worker thread")
        })
        .collect();

    let mut visits_failed = 0usize;
    for handle in handles {
        match handle.join() {
            Ok(failed) => visits_failed += failed,
            Err(_) => {
                error!("a worker thread panicked; its visits were not marked processed and will be retried next run");
            },
        }
    }

    RunSummary { visits_attempted: total, visits_failed }
}

/// Body of one worker thread: build its own pool pair on its own
/// single-threaded runtime, then drain the shared queue until empty.
/// Each popped `visit_id` is processed to completion (guaranteed
/// queue-done signal is implicit — the `pop_front` above already
/// removed it, so there is nothing left to acknowledge) before the
/// next pop.
fn worker_loop(
    worker_index: u32,
    longitudinal: crate::config::LongitudinalConfig,
    data_warehouse: String,
    warehouse_port: u16,
    data_mart: String,
    mart_port: u16,
    locks: DimensionLocks,
    queue: Arc<Mutex<VecDeque<String>>>,
) -> usize {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(err) => {
            error!(worker_index, error = %err, "failed to build worker runtime");
            return 0;
        },
    };

    runtime.block_on(async move {
        let warehouse = match db::connect(&longitudinal, &data_warehouse, warehouse_port).await {
            Ok(pool) => pool,
            Err(err) => {
                error!(worker_index, error = %err, "failed to connect to warehouse, worker exiting idle");
                return 0;
            },
        };
        let mart = match db::connect(&longitudinal, &data_mart, mart_port).await {
            Ok(pool) => pool,
            Err(err) => {
                error!(worker_index, error = %err, "failed to connect to mart, worker exiting idle");
                return 0;
            },
        };
        let ctx = WorkerContext { warehouse, mart, locks };

        let mut failed = 0usize;
        loop {
            let visit_id = {
                let mut queue = queue.lock().unwrap_or_else(|poison| poison.into_inner());
                queue.pop_front()
            };
            let Some(visit_id) = visit_id else { break };

            match process_visit(&ctx, &visit_id).await {
                Ok(()) => {},
                Err(WorkerError::Canceled { .. }) => {
                    // Already logged and marked processed inside
                    // process_visit; not a retry-worthy failure.
                },
                Err(err) => {
                    failed += 1;
                    warn!(worker_index, visit_id, error = %err, "visit left unprocessed, will retry next run");
                },
            }
        }
        failed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_visits_short_circuits_without_spawning_workers() {
        let config = Config::default();
        let summary = fan_out(&config, "wh", 5432, "mart", 5432, Vec::new());
        assert_eq!(summary.visits_attempted, 0);
        assert_eq!(summary.visits_failed, 0);
    }
}
