//! Configuration for SenseDB
//!
//! Every section has defaults, so an empty file (or no file at all) yields a
//! working configuration. Files are TOML:
//!
//! ```toml
//! [queue]
//! batch_size = 500
//!
//! [retention]
//! monitored_path = "/data"
//! delete_pattern = "PERCENTAGE"
//! delete_percent = 15
//! ```

use crate::{Result, SenseError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Records flushed per batch
pub const BATCH_SIZE: usize = 1000;

/// Maximum time a shard waits to fill a batch (ms)
pub const MAX_BATCH_DELAY_MS: u64 = 100;

/// Number of queue shards
pub const SHARD_THREADS: usize = 4;

/// Pending writes a single shard holds before applying backpressure
pub const BACKLOG_CAPACITY: usize = 10_000;

/// Upper bound on sub-intervals a single aggregated query may produce
pub const MAX_AGGREGATION_INTERVALS: i64 = 700;

/// Smallest step used when counting sub-intervals (ms)
pub const MIN_AGGREGATION_STEP_MS: i64 = 1000;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SenseConfig {
    pub storage: StorageConfig,
    pub queue: QueueConfig,
    pub query: QueryConfig,
    pub retention: RetentionConfig,
    pub server: ServerConfig,
}

impl SenseConfig {
    /// Load from a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml(&text)
            .map_err(|e| SenseError::Config(format!("{}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Parse and validate TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: SenseConfig =
            toml::from_str(text).map_err(|e| SenseError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue.shard_threads == 0 {
            return Err(SenseError::Config("queue.shard_threads must be positive".into()));
        }
        if self.queue.batch_size == 0 {
            return Err(SenseError::Config("queue.batch_size must be positive".into()));
        }
        if self.queue.backlog_capacity == 0 {
            return Err(SenseError::Config("queue.backlog_capacity must be positive".into()));
        }
        if self.query.aggregation_threads == 0 {
            return Err(SenseError::Config("query.aggregation_threads must be positive".into()));
        }
        let r = &self.retention;
        if r.limit_per_query == 0 {
            return Err(SenseError::Config("retention.limit_per_query must be positive".into()));
        }
        if r.strategy_rounds_per_sweep == 0 {
            return Err(SenseError::Config(
                "retention.strategy_rounds_per_sweep must be positive".into(),
            ));
        }
        if r.alarm_space_percent > 100 {
            return Err(SenseError::Config(format!(
                "retention.alarm_space_percent must be within 0..=100, got {}",
                r.alarm_space_percent
            )));
        }
        if r.delete_percent > 100 {
            return Err(SenseError::Config(format!(
                "retention.delete_percent must be within 0..=100, got {}",
                r.delete_percent
            )));
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory holding the snapshot file
    pub data_dir: PathBuf,
    /// Seconds between periodic snapshots, 0 disables them
    pub snapshot_interval_secs: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            snapshot_interval_secs: 300,
        }
    }
}

/// Write-behind queue configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub max_batch_delay_ms: u64,
    pub shard_threads: usize,
    pub backlog_capacity: usize,
    /// Sort each batch before flushing it
    pub batch_sort_enabled: bool,
    pub stats_print_interval_ms: u64,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            batch_size: BATCH_SIZE,
            max_batch_delay_ms: MAX_BATCH_DELAY_MS,
            shard_threads: SHARD_THREADS,
            backlog_capacity: BACKLOG_CAPACITY,
            batch_sort_enabled: true,
            stats_print_interval_ms: 10_000,
        }
    }
}

/// Query engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub max_aggregation_intervals: i64,
    /// Sub-queries allowed to run at once
    pub aggregation_threads: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            max_aggregation_intervals: MAX_AGGREGATION_INTERVALS,
            aggregation_threads: 8,
        }
    }
}

/// How many sweeps a retention episode needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DeletePattern {
    /// A fixed number of sweeps
    Round,
    /// Enough sweeps to remove a percentage of all frames
    Percentage,
}

/// Retention configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Path whose volume is monitored
    pub monitored_path: PathBuf,
    pub check_interval_secs: u64,
    /// Alarm when free space drops below this percentage of the volume
    pub alarm_space_percent: u64,
    /// Admission is refused at or below this much free space
    pub min_free_space_mb: u64,
    pub delete_pattern: DeletePattern,
    pub delete_percent: u64,
    pub delete_round_count: i64,
    pub limit_per_query: usize,
    pub strategy_rounds_per_sweep: usize,
    /// Pause before each row delete, 0 disables it
    pub delete_sleep_ms: u64,
    /// Shell command run to compact the historical store
    pub compaction_command: Option<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            monitored_path: PathBuf::from("data"),
            check_interval_secs: 60,
            alarm_space_percent: 10,
            min_free_space_mb: 1024,
            delete_pattern: DeletePattern::Round,
            delete_percent: 10,
            delete_round_count: 20,
            limit_per_query: 1000,
            strategy_rounds_per_sweep: 10,
            delete_sleep_ms: 0,
            compaction_command: None,
        }
    }
}

impl RetentionConfig {
    /// Rows a single sweep can delete at most
    pub fn rows_per_sweep(&self) -> u64 {
        (self.limit_per_query * self.strategy_rounds_per_sweep) as u64
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_addr: String,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8086".to_string(),
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = SenseConfig::from_toml("").unwrap();
        assert_eq!(config.queue.batch_size, BATCH_SIZE);
        assert_eq!(config.retention.delete_pattern, DeletePattern::Round);
        assert_eq!(config.retention.rows_per_sweep(), 10_000);
    }

    #[test]
    fn test_partial_override() {
        let config = SenseConfig::from_toml(
            r#"
            [retention]
            delete_pattern = "PERCENTAGE"
            delete_percent = 15
            compaction_command = "nodetool garbagecollect"

            [queue]
            shard_threads = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.retention.delete_pattern, DeletePattern::Percentage);
        assert_eq!(config.retention.delete_percent, 15);
        assert_eq!(config.queue.shard_threads, 2);
        assert_eq!(config.queue.batch_size, BATCH_SIZE);
        assert!(config.retention.compaction_command.is_some());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            SenseConfig::from_toml("[queue]\nshard_threads = 0"),
            Err(SenseError::Config(_))
        ));
        assert!(matches!(
            SenseConfig::from_toml("[retention]\nalarm_space_percent = 120"),
            Err(SenseError::Config(_))
        ));
    }
}
