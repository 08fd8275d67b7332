//! Query engine for SenseDB
//!
//! Supports:
//! - Raw reads of one key over a time range, ascending or descending
//! - Windowed AVG/MIN/MAX/SUM/COUNT with one point per sub-interval
//! - Latest values and single-frame image lookups

mod aggregates;
mod executor;

pub use aggregates::*;
pub use executor::QueryEngine;

use crate::config::MIN_AGGREGATION_STEP_MS;
use crate::{Aggregation, EntityId, Result, SenseError, SortOrder, TimeRange, Timestamp, TsKvEntry};
use serde::Serialize;

/// Default row limit of raw reads
pub const DEFAULT_LIMIT: usize = 100;

// ============================================================================
// Query Types
// ============================================================================

/// A read of one key of one entity
#[derive(Debug, Clone, PartialEq)]
pub struct ReadQuery {
    pub entity_id: EntityId,
    pub key: String,
    pub start_ts: Timestamp,
    pub end_ts: Timestamp,
    /// Sub-interval width for aggregated reads (ms)
    pub interval: i64,
    pub limit: usize,
    pub aggregation: Aggregation,
    pub order: SortOrder,
}

impl ReadQuery {
    /// Raw points in `[start_ts, end_ts)`
    pub fn raw(entity_id: EntityId, key: impl Into<String>, start_ts: Timestamp, end_ts: Timestamp) -> Self {
        Self {
            entity_id,
            key: key.into(),
            start_ts,
            end_ts,
            interval: 0,
            limit: DEFAULT_LIMIT,
            aggregation: Aggregation::None,
            order: SortOrder::Asc,
        }
    }

    /// One aggregated point per `interval` in `[start_ts, end_ts)`
    pub fn aggregated(
        entity_id: EntityId,
        key: impl Into<String>,
        start_ts: Timestamp,
        end_ts: Timestamp,
        interval: i64,
        aggregation: Aggregation,
    ) -> Self {
        Self {
            interval,
            aggregation,
            ..Self::raw(entity_id, key, start_ts, end_ts)
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_order(mut self, order: SortOrder) -> Self {
        self.order = order;
        self
    }

    pub fn range(&self) -> TimeRange {
        TimeRange::new(self.start_ts, self.end_ts)
    }

    /// Sub-intervals the aggregated form of this query would produce,
    /// `None` when the range itself does not fit in an `i64`
    pub fn interval_count(&self) -> Option<i64> {
        self.end_ts
            .checked_sub(self.start_ts)
            .map(|span| span / self.interval.max(MIN_AGGREGATION_STEP_MS))
    }

    /// Reject malformed queries before any store access
    pub fn validate(&self, max_intervals: i64) -> Result<()> {
        if self.key.trim().is_empty() {
            return Err(SenseError::InvalidArgument("Incorrect key: can't be blank".into()));
        }
        if self.start_ts > self.end_ts {
            return Err(SenseError::InvalidArgument(format!(
                "Incorrect time range: startTs {} is after endTs {}",
                self.start_ts, self.end_ts
            )));
        }
        if self.aggregation != Aggregation::None {
            if self.interval <= 0 {
                return Err(SenseError::InvalidArgument(format!(
                    "Incorrect interval: {} must be positive",
                    self.interval
                )));
            }
            let count = match self.interval_count() {
                Some(count) if (0..=max_intervals).contains(&count) => return Ok(()),
                Some(count) => count.to_string(),
                None => format!("more than {}", i64::MAX / MIN_AGGREGATION_STEP_MS),
            };
            return Err(SenseError::InvalidArgument(format!(
                "Incorrect TsKvQuery. Number of intervals is to high - {}. \
                 Please increase 'interval' parameter for your query or reduce the time range of the query.",
                count
            )));
        }
        Ok(())
    }

    /// Sub-intervals of an aggregated read: `[start, max(start+1, end))`
    /// cut into `interval`-wide pieces, the last one possibly shorter
    pub fn sub_intervals(&self) -> Vec<TimeRange> {
        let end = self.end_ts.max(self.start_ts.saturating_add(1));
        let step = self.interval.max(1);
        let mut ranges = Vec::new();
        let mut start = self.start_ts;
        while start < end {
            let stop = start.saturating_add(step).min(end);
            ranges.push(TimeRange::new(start, stop));
            start = stop;
        }
        ranges
    }
}

// ============================================================================
// Query Result Types
// ============================================================================

/// Result of a [`ReadQuery`]
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Series {
    pub key: String,
    pub entries: Vec<TsKvEntry>,
    /// Largest timestamp returned, or the query start when empty
    pub last_ts: Timestamp,
}

impl Series {
    pub fn new(query: &ReadQuery, entries: Vec<TsKvEntry>) -> Self {
        let last_ts = entries
            .iter()
            .map(|e| e.ts)
            .max()
            .unwrap_or(query.start_ts);
        Self {
            key: query.key.clone(),
            entries,
            last_ts,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
