//! Per-dimension named locks (§4.1, §5).
//!
//! The original passes a dict of 21 `multiprocessing.Lock()`s down to
//! every worker process. This build keeps the same shape — one mutex
//! per dimension, constructed once by the manager — but as in-process
//! `Arc<Mutex<()>>`s shared between worker threads, since the
//! redesign in SPEC_FULL.md §5/§9 replaces OS processes with OS
//! threads. A lock guards nothing but itself; the data it protects is
//! the row in the database, made safe by holding the lock for the
//! full select-then-insert window.

use std::sync::{Arc, Mutex};

/// One named mutex per dimension table that sees concurrent
/// select-or-insert traffic from multiple workers. `facility` is
/// deliberately absent: it is expected to be bootstrapped via static
/// data ahead of a run, mirroring the original `table_locks` set.
#[derive(Clone)]
pub struct DimensionLocks {
    pub admission_source: Arc<Mutex<()>>,
    pub admission_o2sat: Arc<Mutex<()>>,
    pub admission_temp: Arc<Mutex<()>>,
    pub assigned_location: Arc<Mutex<()>>,
    pub admit_reason: Arc<Mutex<()>>,
    pub chief_complaint: Arc<Mutex<()>>,
    pub diagnosis: Arc<Mutex<()>>,
    pub disposition: Arc<Mutex<()>>,
    pub flu_vaccine: Arc<Mutex<()>>,
    pub h1n1_vaccine: Arc<Mutex<()>>,
    pub lab_flag: Arc<Mutex<()>>,
    pub lab_result: Arc<Mutex<()>>,
    pub location: Arc<Mutex<()>>,
    pub note: Arc<Mutex<()>>,
    pub order_number: Arc<Mutex<()>>,
    pub performing_lab: Arc<Mutex<()>>,
    pub pregnancy: Arc<Mutex<()>>,
    pub race: Arc<Mutex<()>>,
    pub reference_range: Arc<Mutex<()>>,
    pub service_area: Arc<Mutex<()>>,
    pub specimen_source: Arc<Mutex<()>>,
}

impl DimensionLocks {
    pub fn new() -> Self {
        Self {
            admission_source: Arc::new(Mutex::new(())),
            admission_o2sat: Arc::new(Mutex::new(())),
            admission_temp: Arc::new(Mutex::new(())),
            assigned_location: Arc::new(Mutex::new(())),
            admit_reason: Arc::new(Mutex::new(())),
            chief_complaint: Arc::new(Mutex::new(())),
            diagnosis: Arc::new(Mutex::new(())),
            disposition: Arc::new(Mutex::new(())),
            flu_vaccine: Arc::new(Mutex::new(())),
            h1n1_vaccine: Arc::new(Mutex::new(())),
            lab_flag: Arc::new(Mutex::new(())),
            lab_result: Arc::new(Mutex::new(())),
            location: Arc::new(Mutex::new(())),
            note: Arc::new(Mutex::new(())),
            order_number: Arc::new(Mutex::new(())),
            performing_lab: Arc::new(Mutex::new(())),
            pregnancy: Arc::new(Mutex::new(())),
            race: Arc::new(Mutex::new(())),
            reference_range: Arc::new(Mutex::new(())),
            service_area: Arc::new(Mutex::new(())),
            specimen_source: Arc::new(Mutex::new(())),
        }
    }
}

impl Default for DimensionLocks {
    fn default() -> Self {
        Self::new()
    }
}

/// Name of the single-instance lock file (§4.6, §6): one manager run
/// at a time per `tmp_dir`.
pub const SINGLE_INSTANCE_LOCK_NAME: &str = "LONGITUDINAL_MANAGER";

/// Open (creating if necessary) the single-instance lock file under
/// `tmp_dir`. The caller wraps the returned `File` in an
/// `fd_lock::RwLock` and holds a write guard for the run's lifetime;
/// the OS releases the advisory lock automatically on process exit,
/// including on panic, since the guard's `Drop` runs during unwind.
pub fn open_lock_file(tmp_dir: &str) -> std::io::Result<std::fs::File> {
    let path = std::path::Path::new(tmp_dir).join(SINGLE_INSTANCE_LOCK_NAME);
    std::fs::OpenOptions::new().create(true).read(true).write(true).open(path)
}
