//! In-memory historical store on a concurrent skip list

use super::TimeseriesStore;
use crate::{EntityId, KvValue, Result, SortOrder, TimeRange, TimeseriesPoint, Timestamp, TsKvEntry};
use chrono::{Datelike, TimeZone, Utc};
use crossbeam_skiplist::SkipMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;

/// Granularity of historical partitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Partitioning {
    Minutes,
    Hours,
    Days,
    #[default]
    Months,
    Years,
    Indefinite,
}

impl Partitioning {
    /// Start of the partition holding `ts`
    pub fn truncate(&self, ts: Timestamp) -> Timestamp {
        match self {
            Partitioning::Minutes => ts - ts.rem_euclid(MINUTE_MS),
            Partitioning::Hours => ts - ts.rem_euclid(HOUR_MS),
            Partitioning::Days => ts - ts.rem_euclid(DAY_MS),
            Partitioning::Months => Utc
                .timestamp_millis_opt(ts)
                .single()
                .and_then(|d| Utc.with_ymd_and_hms(d.year(), d.month(), 1, 0, 0, 0).single())
                .map(|d| d.timestamp_millis())
                .unwrap_or_else(|| ts - ts.rem_euclid(DAY_MS)),
            Partitioning::Years => Utc
                .timestamp_millis_opt(ts)
                .single()
                .and_then(|d| Utc.with_ymd_and_hms(d.year(), 1, 1, 0, 0, 0).single())
                .map(|d| d.timestamp_millis())
                .unwrap_or_else(|| ts - ts.rem_euclid(DAY_MS)),
            Partitioning::Indefinite => 0,
        }
    }
}

/// Skip list key: points of one series sort by partition, then timestamp
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct PointKey {
    entity_id: EntityId,
    key: String,
    partition: Timestamp,
    ts: Timestamp,
}

/// In-memory [`TimeseriesStore`]
pub struct MemoryTimeseriesStore {
    partitioning: Partitioning,
    points: SkipMap<PointKey, KvValue>,
    latest: RwLock<HashMap<(EntityId, String), TsKvEntry>>,
}

impl Default for MemoryTimeseriesStore {
    fn default() -> Self {
        Self::new(Partitioning::default())
    }
}

impl MemoryTimeseriesStore {
    pub fn new(partitioning: Partitioning) -> Self {
        Self {
            partitioning,
            points: SkipMap::new(),
            latest: RwLock::new(HashMap::new()),
        }
    }

    fn point_key(&self, entity_id: EntityId, key: &str, ts: Timestamp) -> PointKey {
        PointKey {
            entity_id,
            key: key.to_string(),
            partition: self.partitioning.truncate(ts),
            ts,
        }
    }

    /// Every historical point, in key order
    pub fn export_points(&self) -> Vec<TimeseriesPoint> {
        self.points
            .iter()
            .map(|e| TimeseriesPoint {
                entity_id: e.key().entity_id,
                key: e.key().key.clone(),
                ts: e.key().ts,
                value: e.value().clone(),
            })
            .collect()
    }

    /// Every latest value
    pub fn export_latest(&self) -> Vec<TimeseriesPoint> {
        self.latest
            .read()
            .iter()
            .map(|((entity_id, _), entry)| TimeseriesPoint::from_entry(*entity_id, entry))
            .collect()
    }

    /// Replace the contents
    pub fn restore(&self, points: Vec<TimeseriesPoint>, latest: Vec<TimeseriesPoint>) {
        self.points.clear();
        for p in points {
            self.points.insert(self.point_key(p.entity_id, &p.key, p.ts), p.value);
        }

        let mut map = self.latest.write();
        map.clear();
        for p in latest {
            map.insert(
                (p.entity_id, p.key.clone()),
                TsKvEntry::new(p.key, p.ts, p.value),
            );
        }
    }
}

impl TimeseriesStore for MemoryTimeseriesStore {
    fn save_batch(&self, points: &[TimeseriesPoint]) -> Result<usize> {
        for p in points {
            self.points
                .insert(self.point_key(p.entity_id, &p.key, p.ts), p.value.clone());
        }
        Ok(points.len())
    }

    fn save_latest(&self, entity_id: EntityId, entry: &TsKvEntry) -> Result<()> {
        let mut latest = self.latest.write();
        let slot = latest.entry((entity_id, entry.key.clone()));
        match slot {
            std::collections::hash_map::Entry::Occupied(mut current) => {
                if current.get().ts <= entry.ts {
                    current.insert(entry.clone());
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(entry.clone());
            }
        }
        Ok(())
    }

    fn find_range(
        &self,
        entity_id: EntityId,
        key: &str,
        range: TimeRange,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<TsKvEntry>> {
        if range.end <= range.start || limit == 0 {
            return Ok(Vec::new());
        }

        let lo = self.point_key(entity_id, key, range.start);
        let hi = self.point_key(entity_id, key, range.end);
        let to_entry = |e: crossbeam_skiplist::map::Entry<'_, PointKey, KvValue>| {
            TsKvEntry::new(key, e.key().ts, e.value().clone())
        };

        let points = match order {
            SortOrder::Asc => self.points.range(lo..hi).take(limit).map(to_entry).collect(),
            SortOrder::Desc => self
                .points
                .range(lo..hi)
                .rev()
                .take(limit)
                .map(to_entry)
                .collect(),
        };
        Ok(points)
    }

    fn find_latest(&self, entity_id: EntityId, keys: &[String]) -> Result<Vec<TsKvEntry>> {
        let latest = self.latest.read();
        Ok(keys
            .iter()
            .filter_map(|k| latest.get(&(entity_id, k.clone())).cloned())
            .collect())
    }

    fn delete_range(
        &self,
        entity_id: EntityId,
        key: &str,
        range: TimeRange,
        partitions: &[Timestamp],
    ) -> Result<usize> {
        if range.end <= range.start {
            return Ok(0);
        }

        let mut removed = 0;
        for &partition in partitions {
            let lo = PointKey {
                entity_id,
                key: key.to_string(),
                partition,
                ts: range.start,
            };
            let hi = PointKey {
                ts: range.end,
                ..lo.clone()
            };
            for entry in self.points.range(lo..hi) {
                if entry.remove() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    fn to_partition_ts(&self, ts: Timestamp) -> Timestamp {
        self.partitioning.truncate(ts)
    }

    fn len(&self) -> usize {
        self.points.len()
    }
}
