//! Capacity-driven retention
//!
//! Every tick samples the monitored volume. While free space is below the
//! alarm threshold, a sweep deletes the oldest image frames (their
//! recognition records and the raw `image` points) in bounded groups, then
//! compacts once enough sweeps have run.
//!
//! ```text
//! IDLE -> SAMPLING -> (ARMED | IDLE) -> DELETING -> COMPACTING -> IDLE
//! ```

mod compact;
mod probe;
mod state;

pub use compact::{CommandCompactor, Compactor, NoopCompactor, SnapshotCompactor};
pub use probe::{DiskProbe, FixedProbe, SpaceProbe, GB, MB};
pub use state::{RetentionState, RetentionStatus, SweepGuard};

use crate::config::{DeletePattern, RetentionConfig};
use crate::store::{RecognitionStore, TimeseriesStore};
use crate::{EntityId, Result, SenseError, TimeRange, Timestamp, IMAGE_KEY};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Free and total space of one sample
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceSample {
    pub free_mb: u64,
    pub free_gb: u64,
    pub total_gb: u64,
}

impl SpaceSample {
    /// Threshold under which free space raises the alarm
    pub fn alarm_gb(&self, alarm_space_percent: u64) -> u64 {
        self.total_gb * alarm_space_percent / 100
    }
}

/// Phase a sweep failed in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepPhase {
    Deleting,
    Compacting,
}

impl fmt::Display for SweepPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweepPhase::Deleting => f.write_str("DELETING"),
            SweepPhase::Compacting => f.write_str("COMPACTING"),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// Free space is outside the alarm zone
    Idle,
    /// Another sweep is running
    Skipped,
    /// Alarmed, but space has not shrunk and few frames arrived since the
    /// last sweep
    Held,
    /// A sweep ran to completion
    Swept { deleted: u64, compacted: bool },
    /// A sweep failed; the error was logged
    Failed { phase: SweepPhase },
}

/// Position of a sweep in the stream of frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteCursor {
    /// Next group starts at this timestamp (inclusive)
    pub min_ts: Timestamp,
    pub groups_done: usize,
    /// No further group will run in this sweep
    pub exhausted: bool,
    /// Rows removed, set once exhausted
    pub deleted: u64,
}

impl DeleteCursor {
    pub fn start(min_ts: Timestamp) -> Self {
        Self {
            min_ts,
            groups_done: 0,
            exhausted: false,
            deleted: 0,
        }
    }
}

/// Retention engine
pub struct RetentionEngine {
    config: RetentionConfig,
    state: Arc<RetentionState>,
    probe: Arc<dyn SpaceProbe>,
    compactor: Arc<dyn Compactor>,
    recognitions: Arc<dyn RecognitionStore>,
    timeseries: Arc<dyn TimeseriesStore>,
}

impl RetentionEngine {
    pub fn new(
        config: RetentionConfig,
        state: Arc<RetentionState>,
        probe: Arc<dyn SpaceProbe>,
        compactor: Arc<dyn Compactor>,
        recognitions: Arc<dyn RecognitionStore>,
        timeseries: Arc<dyn TimeseriesStore>,
    ) -> Self {
        Self {
            config,
            state,
            probe,
            compactor,
            recognitions,
            timeseries,
        }
    }

    pub fn state(&self) -> &Arc<RetentionState> {
        &self.state
    }

    pub fn config(&self) -> &RetentionConfig {
        &self.config
    }

    /// Run the state machine once. A no-op while another sweep runs.
    pub async fn run_tick(&self) -> Result<TickOutcome> {
        let sample = self.sample().await?;
        let alarm_gb = sample.alarm_gb(self.config.alarm_space_percent);

        if sample.free_gb >= alarm_gb {
            self.state.reset();
            return Ok(TickOutcome::Idle);
        }

        // Sweep counters are only read while holding the slot, so a tick
        // that waited on the probe never acts on another sweep's old figures
        let Some(_guard) = self.state.try_claim() else {
            return Ok(TickOutcome::Skipped);
        };

        if self.state.rounds_needed() <= 0 {
            let rounds = self.compute_rounds_needed()?;
            self.state.set_rounds_needed(rounds);
        }

        let last_remain = self.state.last_remain_disk_gb();
        let added = self.state.added_since_last_sweep();
        let rows_per_sweep = self.config.rows_per_sweep();
        let proceed = last_remain == 0 || sample.free_gb < last_remain || added > rows_per_sweep;
        if !proceed {
            debug!(
                "Holding retention: free={}GB, lastRemainDisk={}GB, added={}",
                sample.free_gb, last_remain, added
            );
            return Ok(TickOutcome::Held);
        }

        warn!(
            "Disk space low: free={}GB, total={}GB, lastRemainDisk={}GB, alarm={}GB ({}%)",
            sample.free_gb,
            sample.total_gb,
            last_remain,
            alarm_gb,
            self.config.alarm_space_percent
        );
        warn!(
            "Frames added since last sweep = {}, maximum deleted per sweep = {}",
            added, rows_per_sweep
        );
        self.state.begin_sweep(sample.free_gb);

        let deleted = match self.delete_history().await {
            Ok(deleted) => deleted,
            Err(e) => {
                self.log_failure(SweepPhase::Deleting, &sample, &e);
                return Ok(TickOutcome::Failed {
                    phase: SweepPhase::Deleting,
                });
            }
        };

        match self.compact_if_due().await {
            Ok(compacted) => Ok(TickOutcome::Swept { deleted, compacted }),
            Err(e) => {
                self.log_failure(SweepPhase::Compacting, &sample, &e);
                Ok(TickOutcome::Failed {
                    phase: SweepPhase::Compacting,
                })
            }
        }
    }

    /// Run [`run_tick`](Self::run_tick) every `period` until `shutdown` fires
    pub fn spawn(self: Arc<Self>, period: Duration, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "Retention scheduler started: path={}, period={:?}",
                self.config.monitored_path.display(),
                period
            );
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        match self.run_tick().await {
                            Ok(outcome) => debug!("Retention tick: {:?}", outcome),
                            Err(e) => warn!("Retention tick aborted: {}", e),
                        }
                    }
                }
            }
            info!("Retention scheduler stopped");
        })
    }

    // ========================================================================
    // SAMPLING
    // ========================================================================

    /// Read the volume and update admission
    pub async fn sample(&self) -> Result<SpaceSample> {
        let probe = self.probe.clone();
        let reading = tokio::task::spawn_blocking(move || probe.read())
            .await
            .map_err(|e| SenseError::Internal(format!("space probe failed: {}", e)))?;

        let Some((available, total)) = reading else {
            let path = self.config.monitored_path.display().to_string();
            warn!("Space probe returned nothing for {}", path);
            return Err(SenseError::ProbeUnavailable(path));
        };

        let sample = SpaceSample {
            free_mb: available / MB,
            free_gb: available / GB,
            total_gb: total / GB,
        };

        let can_save = sample.free_mb > self.config.min_free_space_mb;
        if !can_save {
            warn!(
                "Free space {}MB is at or below {}MB, refusing new data",
                sample.free_mb, self.config.min_free_space_mb
            );
        }
        self.state.set_can_save_data(can_save);
        self.state.record_space(sample.free_gb, sample.total_gb);

        Ok(sample)
    }

    fn compute_rounds_needed(&self) -> Result<i64> {
        let rows_per_sweep = self.config.rows_per_sweep() as i64;
        let rounds = match self.config.delete_pattern {
            DeletePattern::Round => self.config.delete_round_count,
            DeletePattern::Percentage => {
                let frames = self.recognitions.count_matching()? as i64;
                if frames <= 0 {
                    0
                } else {
                    frames * self.config.delete_percent as i64 / 100 / rows_per_sweep
                }
            }
        };
        info!(
            "Delete pattern {:?}: {} sweeps needed, about {} rows",
            self.config.delete_pattern,
            rounds,
            rounds * rows_per_sweep
        );
        Ok(rounds)
    }

    // ========================================================================
    // DELETING
    // ========================================================================

    async fn delete_history(&self) -> Result<u64> {
        let start = Instant::now();
        let Some(oldest) = self.recognitions.min_ts()? else {
            warn!("No frames to delete, skipping");
            return Ok(0);
        };

        let mut cursor = DeleteCursor::start(oldest);
        while !cursor.exhausted {
            cursor = self.delete_group(cursor).await?;
        }

        self.state.add_deleted(cursor.deleted);
        info!(
            "Sweep {} deleted {} frames in {:?}",
            self.state.rounds_executed() + 1,
            cursor.deleted,
            start.elapsed()
        );
        Ok(cursor.deleted)
    }

    /// Delete one group of the oldest frames at or after `cursor.min_ts`
    pub async fn delete_group(&self, mut cursor: DeleteCursor) -> Result<DeleteCursor> {
        let limit = self.config.limit_per_query;
        let rows = self.recognitions.find_oldest(cursor.min_ts, limit)?;
        cursor.groups_done += 1;

        let size = rows.len();
        let next = cursor.groups_done < self.config.strategy_rounds_per_sweep && size >= limit;

        for row in &rows {
            if self.config.delete_sleep_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.config.delete_sleep_ms)).await;
            }
            let partition = self.timeseries.to_partition_ts(row.ts);
            self.timeseries.delete_range(
                EntityId::device(row.device_id),
                IMAGE_KEY,
                TimeRange::new(row.ts, row.ts + 1),
                &[partition],
            )?;
            self.recognitions.delete_by_ts_and_device(row.ts, row.device_id)?;
        }

        if let Some(last) = rows.last() {
            cursor.min_ts = last.ts;
        }
        if !next {
            cursor.exhausted = true;
            cursor.deleted = ((cursor.groups_done - 1) * limit + size) as u64;
        }
        Ok(cursor)
    }

    // ========================================================================
    // COMPACTING
    // ========================================================================

    async fn compact_if_due(&self) -> Result<bool> {
        let executed = self.state.increment_rounds_executed();
        let needed = self.state.rounds_needed();
        let due = executed >= needed && (needed == 0 || executed % needed == 0);
        if !due {
            return Ok(false);
        }

        let compactor = self.compactor.clone();
        info!("Compacting with {} compactor after {} sweeps", compactor.name(), executed);
        tokio::task::spawn_blocking(move || compactor.compact())
            .await
            .map_err(|e| SenseError::Internal(format!("compaction task failed: {}", e)))??;

        match self.sample().await {
            Ok(sample) => warn!(
                "After compaction: free={}GB, total={}GB, lastRemainDisk={}GB, alarm={}GB ({}%)",
                sample.free_gb,
                sample.total_gb,
                self.state.last_remain_disk_gb(),
                sample.alarm_gb(self.config.alarm_space_percent),
                self.config.alarm_space_percent
            ),
            Err(e) => debug!("Cannot resample after compaction: {}", e),
        }
        Ok(true)
    }

    fn log_failure(&self, phase: SweepPhase, sample: &SpaceSample, e: &SenseError) {
        error!(
            "Retention sweep failed in {}: {} (free={}GB, total={}GB, roundsExecuted={}, roundsNeeded={}, deleted={})",
            phase,
            e,
            sample.free_gb,
            sample.total_gb,
            self.state.rounds_executed(),
            self.state.rounds_needed(),
            self.state.deleted_count()
        );
    }
}
