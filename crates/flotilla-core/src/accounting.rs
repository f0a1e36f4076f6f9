//! Global and per-transfer counters.
//!
//! One [`Stats`] value is carried by the engine [`Ctx`](crate::context::Ctx);
//! workers update it with atomic operations and the most recent error is kept
//! behind a mutex. The aggregate drives the summary line and the process
//! exit code.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

use crate::error::{exitcode, FsError};

/// Counters for one sync run.
#[derive(Debug)]
pub struct Stats {
    bytes: AtomicU64,
    transfers: AtomicU64,
    checks: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    retries: AtomicU64,
    deletes: AtomicU64,
    deleted_dirs: AtomicU64,
    server_side_copies: AtomicU64,
    server_side_moves: AtomicU64,

    fatal_error: AtomicBool,
    retry_error: AtomicBool,
    max_transfer_reached: AtomicBool,

    /// Byte budget for the whole run; once exceeded new transfers fail with
    /// [`FsError::MaxTransferLimitReached`].
    max_transfer: Option<u64>,

    last_error: Mutex<Option<FsError>>,
    in_flight: Mutex<HashMap<Uuid, TransferSnapshot>>,
    start: Instant,
}

/// Point-in-time view of one transfer.
#[derive(Debug, Clone, Serialize)]
pub struct TransferSnapshot {
    pub id: Uuid,
    pub remote: String,
    /// Expected size; `None` while streaming.
    pub size: Option<u64>,
    pub bytes: u64,
}

impl Stats {
    pub fn new() -> Arc<Self> {
        Self::with_max_transfer(None)
    }

    /// Stats with a transfer byte budget.
    pub fn with_max_transfer(max_transfer: Option<u64>) -> Arc<Self> {
        Arc::new(Stats {
            bytes: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
            deleted_dirs: AtomicU64::new(0),
            server_side_copies: AtomicU64::new(0),
            server_side_moves: AtomicU64::new(0),
            fatal_error: AtomicBool::new(false),
            retry_error: AtomicBool::new(false),
            max_transfer_reached: AtomicBool::new(false),
            max_transfer,
            last_error: Mutex::new(None),
            in_flight: Mutex::new(HashMap::new()),
            start: Instant::now(),
        })
    }

    // -- transfer lifecycle -------------------------------------------------

    /// Begin accounting one transfer; finish it with
    /// [`TransferHandle::done`].
    pub fn start_transfer(
        self: &Arc<Self>,
        remote: impl Into<String>,
        size: Option<u64>,
    ) -> TransferHandle {
        let snap = TransferSnapshot {
            id: Uuid::new_v4(),
            remote: remote.into(),
            size,
            bytes: 0,
        };
        let id = snap.id;
        self.in_flight.lock().unwrap().insert(id, snap);
        TransferHandle {
            stats: Arc::clone(self),
            id,
        }
    }

    /// Record bytes moved. Returns an error once the run's byte budget is
    /// exhausted; the caller stops scheduling new work.
    pub fn add_bytes(&self, n: u64) -> Result<(), FsError> {
        let total = self.bytes.fetch_add(n, Ordering::Relaxed) + n;
        if let Some(limit) = self.max_transfer {
            if total > limit {
                self.max_transfer_reached.store(true, Ordering::Relaxed);
                return Err(FsError::MaxTransferLimitReached);
            }
        }
        Ok(())
    }

    pub fn add_check(&self) {
        self.checks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_skip(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_delete(&self) {
        self.deletes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_deleted_dir(&self) {
        self.deleted_dirs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_server_side_copy(&self) {
        self.server_side_copies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_server_side_move(&self) {
        self.server_side_moves.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure, classifying it into the aggregate flags.
    pub fn error(&self, err: &FsError) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        if err.is_fatal() {
            self.fatal_error.store(true, Ordering::Relaxed);
        } else if err.is_retryable() {
            self.retry_error.store(true, Ordering::Relaxed);
        }
        if matches!(err, FsError::MaxTransferLimitReached) {
            self.max_transfer_reached.store(true, Ordering::Relaxed);
        }
        warn!(error = %err, "recording error");
        *self.last_error.lock().unwrap() = Some(err.clone());
    }

    // -- aggregate queries --------------------------------------------------

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::Relaxed)
    }

    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::Relaxed)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::Relaxed)
    }

    pub fn deleted_dirs(&self) -> u64 {
        self.deleted_dirs.load(Ordering::Relaxed)
    }

    pub fn server_side_copies(&self) -> u64 {
        self.server_side_copies.load(Ordering::Relaxed)
    }

    pub fn server_side_moves(&self) -> u64 {
        self.server_side_moves.load(Ordering::Relaxed)
    }

    pub fn had_fatal_error(&self) -> bool {
        self.fatal_error.load(Ordering::Relaxed)
    }

    pub fn had_retry_error(&self) -> bool {
        self.retry_error.load(Ordering::Relaxed)
    }

    pub fn max_transfer_reached(&self) -> bool {
        self.max_transfer_reached.load(Ordering::Relaxed)
    }

    pub fn last_error(&self) -> Option<FsError> {
        self.last_error.lock().unwrap().clone()
    }

    /// Transfers currently in flight.
    pub fn in_flight(&self) -> Vec<TransferSnapshot> {
        self.in_flight.lock().unwrap().values().cloned().collect()
    }

    /// Mean throughput since the run started, bytes per second.
    pub fn speed(&self) -> f64 {
        let elapsed = self.start.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            return 0.0;
        }
        self.bytes() as f64 / elapsed
    }

    /// Estimated time to move `total_bytes` at the observed throughput.
    pub fn eta(&self, total_bytes: u64) -> Option<Duration> {
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        let remaining = total_bytes.saturating_sub(self.bytes());
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// The exit code reflecting the aggregate, most severe kind first.
    pub fn exit_code(&self, error_on_no_transfer: bool) -> i32 {
        if self.errors() == 0 {
            if error_on_no_transfer && self.transfers() == 0 {
                return exitcode::NO_FILES_TRANSFERRED;
            }
            return exitcode::SUCCESS;
        }
        if self.max_transfer_reached() {
            return exitcode::TRANSFER_EXCEEDED;
        }
        if self.had_fatal_error() {
            return exitcode::FATAL_ERROR;
        }
        if let Some(err) = self.last_error() {
            match err.exit_code() {
                exitcode::DIR_NOT_FOUND => return exitcode::DIR_NOT_FOUND,
                exitcode::FILE_NOT_FOUND => return exitcode::FILE_NOT_FOUND,
                exitcode::USAGE => return exitcode::USAGE,
                _ => {}
            }
        }
        if self.had_retry_error() {
            exitcode::RETRY_ERROR
        } else {
            exitcode::NO_RETRY_ERROR
        }
    }
}

/// Live handle for one accounted transfer.
#[derive(Debug)]
pub struct TransferHandle {
    stats: Arc<Stats>,
    id: Uuid,
}

impl TransferHandle {
    /// Record `n` bytes moved on both the transfer and the run totals.
    pub fn add_bytes(&self, n: u64) -> Result<(), FsError> {
        if let Some(snap) = self.stats.in_flight.lock().unwrap().get_mut(&self.id) {
            snap.bytes += n;
        }
        self.stats.add_bytes(n)
    }

    /// Finish the transfer. A `None` error counts it as completed.
    pub fn done(self, err: Option<&FsError>) {
        self.stats.in_flight.lock().unwrap().remove(&self.id);
        match err {
            None => {
                self.stats.transfers.fetch_add(1, Ordering::Relaxed);
            }
            Some(e) => self.stats.error(e),
        }
    }
}
