//! Admission and retention state shared by ingestion and the retention engine

use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

/// Counters and flags of the retention state machine.
///
/// One instance per process, shared through an `Arc` by the ingestor (which
/// reads `can_save_data` and counts image writes) and the retention engine.
#[derive(Debug)]
pub struct RetentionState {
    running: AtomicBool,
    can_save_data: AtomicBool,
    space_available_gb: AtomicU64,
    space_total_gb: AtomicU64,
    last_remain_disk_gb: AtomicU64,
    rounds_needed: AtomicI64,
    rounds_executed: AtomicI64,
    deleted_count: AtomicU64,
    added_since_last_sweep: AtomicU64,
}

impl Default for RetentionState {
    fn default() -> Self {
        Self {
            running: AtomicBool::new(false),
            can_save_data: AtomicBool::new(true),
            space_available_gb: AtomicU64::new(0),
            space_total_gb: AtomicU64::new(0),
            last_remain_disk_gb: AtomicU64::new(0),
            rounds_needed: AtomicI64::new(0),
            rounds_executed: AtomicI64::new(0),
            deleted_count: AtomicU64::new(0),
            added_since_last_sweep: AtomicU64::new(0),
        }
    }
}

/// Serializable copy of [`RetentionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStatus {
    pub running: bool,
    pub can_save_data: bool,
    pub space_available_gb: u64,
    pub space_total_gb: u64,
    pub last_remain_disk_gb: u64,
    pub rounds_needed: i64,
    pub rounds_executed: i64,
    pub deleted_count: u64,
    pub added_since_last_sweep: u64,
}

impl RetentionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    // ========================================================================
    // Admission
    // ========================================================================

    pub fn can_save_data(&self) -> bool {
        self.can_save_data.load(Ordering::Acquire)
    }

    pub fn set_can_save_data(&self, allowed: bool) {
        self.can_save_data.store(allowed, Ordering::Release);
    }

    /// Count one accepted image write. Ignored until the first sweep.
    pub fn record_image_write(&self) {
        if self.last_remain_disk_gb.load(Ordering::Acquire) == 0 {
            return;
        }
        self.added_since_last_sweep.fetch_add(1, Ordering::AcqRel);
    }

    // ========================================================================
    // Sampling
    // ========================================================================

    pub fn record_space(&self, available_gb: u64, total_gb: u64) {
        self.space_available_gb.store(available_gb, Ordering::Release);
        self.space_total_gb.store(total_gb, Ordering::Release);
    }

    /// Zero the sweep counters once free space leaves the alarm zone
    pub fn reset(&self) {
        self.added_since_last_sweep.store(0, Ordering::Release);
        self.deleted_count.store(0, Ordering::Release);
        self.last_remain_disk_gb.store(0, Ordering::Release);
        self.rounds_executed.store(0, Ordering::Release);
        self.rounds_needed.store(0, Ordering::Release);
    }

    // ========================================================================
    // Sweeps
    // ========================================================================

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn rounds_needed(&self) -> i64 {
        self.rounds_needed.load(Ordering::Acquire)
    }

    pub fn set_rounds_needed(&self, rounds: i64) {
        self.rounds_needed.store(rounds, Ordering::Release);
    }

    pub fn rounds_executed(&self) -> i64 {
        self.rounds_executed.load(Ordering::Acquire)
    }

    /// Count a finished sweep, returning the new total
    pub fn increment_rounds_executed(&self) -> i64 {
        self.rounds_executed.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn last_remain_disk_gb(&self) -> u64 {
        self.last_remain_disk_gb.load(Ordering::Acquire)
    }

    pub fn added_since_last_sweep(&self) -> u64 {
        self.added_since_last_sweep.load(Ordering::Acquire)
    }

    pub fn deleted_count(&self) -> u64 {
        self.deleted_count.load(Ordering::Acquire)
    }

    pub fn add_deleted(&self, rows: u64) {
        self.deleted_count.fetch_add(rows, Ordering::AcqRel);
    }

    /// Prepare the counters for a sweep starting at `free_gb`.
    ///
    /// Image writes counted since the previous sweep are reduced by what that
    /// sweep deleted, unless free space kept shrinking anyway.
    pub fn begin_sweep(&self, free_gb: u64) {
        let last = self.last_remain_disk_gb();
        if last == 0 {
            self.added_since_last_sweep.store(0, Ordering::Release);
        } else if free_gb >= last {
            let added = self.added_since_last_sweep();
            let deleted = self.deleted_count();
            self.added_since_last_sweep
                .store(added.saturating_sub(deleted), Ordering::Release);
        }
        self.last_remain_disk_gb.store(free_gb, Ordering::Release);
        self.deleted_count.store(0, Ordering::Release);
    }

    /// Claim the single sweep slot; `None` if a sweep is already running
    pub fn try_claim(self: &Arc<Self>) -> Option<SweepGuard> {
        self.running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SweepGuard {
                state: self.clone(),
            })
    }

    pub fn status(&self) -> RetentionStatus {
        RetentionStatus {
            running: self.is_running(),
            can_save_data: self.can_save_data(),
            space_available_gb: self.space_available_gb.load(Ordering::Acquire),
            space_total_gb: self.space_total_gb.load(Ordering::Acquire),
            last_remain_disk_gb: self.last_remain_disk_gb(),
            rounds_needed: self.rounds_needed(),
            rounds_executed: self.rounds_executed(),
            deleted_count: self.deleted_count(),
            added_since_last_sweep: self.added_since_last_sweep(),
        }
    }
}

/// Holds the sweep slot; releases it on drop, including on error paths
#[derive(Debug)]
pub struct SweepGuard {
    state: Arc<RetentionState>,
}

impl Drop for SweepGuard {
    fn drop(&mut self) {
        self.state.running.store(false, Ordering::Release);
    }
}
