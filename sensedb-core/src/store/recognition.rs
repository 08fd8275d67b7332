//! In-memory recognition store

use super::RecognitionStore;
use crate::{RecognitionKey, RecognitionRecord, Result, Timestamp};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;
use uuid::Uuid;

/// In-memory [`RecognitionStore`], ordered by `(ts, deviceId, ability)`
#[derive(Default)]
pub struct MemoryRecognitionStore {
    rows: RwLock<BTreeMap<RecognitionKey, RecognitionRecord>>,
}

impl MemoryRecognitionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, in key order
    pub fn export(&self) -> Vec<RecognitionRecord> {
        self.rows.read().values().cloned().collect()
    }

    /// Replace the contents
    pub fn restore(&self, records: Vec<RecognitionRecord>) {
        let mut rows = self.rows.write();
        rows.clear();
        for r in records {
            rows.insert(r.key(), r);
        }
    }

    /// Look up one record by natural key
    pub fn get(&self, device_id: Uuid, ts: Timestamp, ability: &str) -> Option<RecognitionRecord> {
        let key = RecognitionKey {
            ts,
            device_id,
            ability: ability.to_string(),
        };
        self.rows.read().get(&key).cloned()
    }

    /// Smallest key at `ts`
    fn ts_floor(ts: Timestamp) -> RecognitionKey {
        RecognitionKey {
            ts,
            device_id: Uuid::nil(),
            ability: String::new(),
        }
    }
}

impl RecognitionStore for MemoryRecognitionStore {
    fn upsert_batch(&self, records: &[RecognitionRecord]) -> Result<usize> {
        let mut rows = self.rows.write();
        for r in records {
            match rows.get_mut(&r.key()) {
                Some(existing) => {
                    existing.id = r.id;
                    existing.ability_type = r.ability_type;
                    existing.value = r.value.clone();
                    existing.extra_info = r.extra_info.clone();
                    existing.created_time = r.created_time;
                    existing.updated_time = r.updated_time;
                }
                None => {
                    rows.insert(r.key(), r.clone());
                }
            }
        }
        Ok(records.len())
    }

    fn find_oldest(&self, min_ts: Timestamp, limit: usize) -> Result<Vec<RecognitionRecord>> {
        let rows = self.rows.read();
        Ok(rows
            .range((Bound::Included(Self::ts_floor(min_ts)), Bound::Unbounded))
            .map(|(_, r)| r)
            .filter(|r| r.is_frame())
            .take(limit)
            .cloned()
            .collect())
    }

    fn min_ts(&self) -> Result<Option<Timestamp>> {
        let rows = self.rows.read();
        Ok(rows.values().find(|r| r.is_frame()).map(|r| r.ts))
    }

    fn delete_by_ts_and_device(&self, ts: Timestamp, device_id: Uuid) -> Result<usize> {
        let mut rows = self.rows.write();
        let start = Bound::Included(RecognitionKey {
            ts,
            device_id,
            ability: String::new(),
        });
        let doomed: Vec<RecognitionKey> = rows
            .range((start, Bound::Unbounded))
            .take_while(|(k, _)| k.ts == ts && k.device_id == device_id)
            .map(|(k, _)| k.clone())
            .collect();

        for key in &doomed {
            rows.remove(key);
        }
        Ok(doomed.len())
    }

    fn count_matching(&self) -> Result<u64> {
        Ok(self.rows.read().values().filter(|r| r.is_frame()).count() as u64)
    }

    fn find(
        &self,
        device_id: Uuid,
        ability: &str,
        start_ts: Timestamp,
        end_ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<RecognitionRecord>> {
        if end_ts <= start_ts {
            return Ok(Vec::new());
        }
        let rows = self.rows.read();
        Ok(rows
            .range(Self::ts_floor(start_ts)..Self::ts_floor(end_ts))
            .map(|(_, r)| r)
            .filter(|r| r.device_id == device_id && r.ability == ability)
            .take(limit)
            .cloned()
            .collect())
    }

    fn delete_by_device(&self, device_id: Uuid) -> Result<usize> {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|k, _| k.device_id != device_id);
        Ok(before - rows.len())
    }

    fn len(&self) -> usize {
        self.rows.read().len()
    }
}
