//! Storage collaborators
//!
//! The ingestion, query and retention paths only see the traits below.
//! The in-memory implementations back the server and the tests, and can be
//! persisted as a checksummed snapshot.

mod attributes;
mod capability;
mod recognition;
mod snapshot;
mod timeseries;

pub use attributes::{AttributeKv, AttributeScope, MemoryAttributeStore};
pub use capability::MemoryCapabilityStore;
pub use recognition::MemoryRecognitionStore;
pub use snapshot::{MemoryStores, StoreSnapshot, SNAPSHOT_FILE};
pub use timeseries::{MemoryTimeseriesStore, Partitioning};

use crate::queue::BatchSink;
use crate::{
    DeviceCapability, EntityId, KvValue, RecognitionRecord, Result, SortOrder, TimeRange,
    TimeseriesPoint, Timestamp, TsKvEntry,
};
use std::sync::Arc;
use uuid::Uuid;

/// Historical points plus the latest-value projection
pub trait TimeseriesStore: Send + Sync {
    /// Write historical points, returning rows written
    fn save_batch(&self, points: &[TimeseriesPoint]) -> Result<usize>;

    /// Upsert the latest value of `(entity, key)`; older timestamps are ignored
    fn save_latest(&self, entity_id: EntityId, entry: &TsKvEntry) -> Result<()>;

    /// Points of one key within `range`, at most `limit`, ordered by ts
    fn find_range(
        &self,
        entity_id: EntityId,
        key: &str,
        range: TimeRange,
        limit: usize,
        order: SortOrder,
    ) -> Result<Vec<TsKvEntry>>;

    /// Latest values of `keys`; unknown keys are skipped
    fn find_latest(&self, entity_id: EntityId, keys: &[String]) -> Result<Vec<TsKvEntry>>;

    /// Delete points of one key within `range`, looking only in the listed
    /// partitions. Returns rows removed.
    fn delete_range(
        &self,
        entity_id: EntityId,
        key: &str,
        range: TimeRange,
        partitions: &[Timestamp],
    ) -> Result<usize>;

    /// Start of the partition holding `ts`
    fn to_partition_ts(&self, ts: Timestamp) -> Timestamp;

    /// Number of historical points
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Recognition records keyed by `(deviceId, ts, ability)`
pub trait RecognitionStore: Send + Sync {
    /// Insert or update every record by natural key
    fn upsert_batch(&self, records: &[RecognitionRecord]) -> Result<usize>;

    /// Oldest frame records with `ts >= min_ts`, ascending
    fn find_oldest(&self, min_ts: Timestamp, limit: usize) -> Result<Vec<RecognitionRecord>>;

    /// Timestamp of the oldest frame record
    fn min_ts(&self) -> Result<Option<Timestamp>>;

    /// Delete every record of a device at `ts`, returning rows removed
    fn delete_by_ts_and_device(&self, ts: Timestamp, device_id: Uuid) -> Result<usize>;

    /// Number of frame records
    fn count_matching(&self) -> Result<u64>;

    /// Records of one device and ability within `[start_ts, end_ts)`
    fn find(
        &self,
        device_id: Uuid,
        ability: &str,
        start_ts: Timestamp,
        end_ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<RecognitionRecord>>;

    fn delete_by_device(&self, device_id: Uuid) -> Result<usize>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Static device capabilities
pub trait CapabilityStore: Send + Sync {
    fn find_by_device(&self, device_id: Uuid) -> Result<Vec<DeviceCapability>>;

    fn find_by_device_and_ability(
        &self,
        device_id: Uuid,
        ability: &str,
    ) -> Result<Option<DeviceCapability>>;

    fn create(&self, capability: DeviceCapability) -> Result<DeviceCapability>;
}

/// Entity attributes
pub trait AttributeStore: Send + Sync {
    fn save(
        &self,
        entity_id: EntityId,
        scope: AttributeScope,
        key: &str,
        value: KvValue,
        last_update_ts: Timestamp,
    ) -> Result<()>;

    fn get(&self, entity_id: EntityId, scope: AttributeScope, key: &str) -> Result<Option<AttributeKv>>;
}

/// Flushes timeseries batches into a [`TimeseriesStore`]
pub struct TimeseriesSink(pub Arc<dyn TimeseriesStore>);

impl BatchSink<TimeseriesPoint> for TimeseriesSink {
    fn flush(&self, batch: &[TimeseriesPoint]) -> Result<usize> {
        self.0.save_batch(batch)
    }
}

/// Flushes recognition batches into a [`RecognitionStore`]
pub struct RecognitionSink(pub Arc<dyn RecognitionStore>);

impl BatchSink<RecognitionRecord> for RecognitionSink {
    fn flush(&self, batch: &[RecognitionRecord]) -> Result<usize> {
        self.0.upsert_batch(batch)
    }
}
