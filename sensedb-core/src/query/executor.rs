//! Query executor
//!
//! Raw reads go straight to the store. Aggregated reads fan out one
//! sub-query per sub-interval onto the blocking pool, bounded by a
//! semaphore, and are joined before the series is returned.

use super::{aggregate, ReadQuery, Series};
use crate::config::QueryConfig;
use crate::store::TimeseriesStore;
use crate::{Aggregation, EntityId, Result, SenseError, SortOrder, Timestamp, TsKvEntry, IMAGE_KEY};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::debug;
use uuid::Uuid;

/// Query engine over a [`TimeseriesStore`]
#[derive(Clone)]
pub struct QueryEngine {
    store: Arc<dyn TimeseriesStore>,
    max_intervals: i64,
    permits: Arc<Semaphore>,
}

impl QueryEngine {
    pub fn new(store: Arc<dyn TimeseriesStore>, config: &QueryConfig) -> Self {
        Self {
            store,
            max_intervals: config.max_aggregation_intervals,
            permits: Arc::new(Semaphore::new(config.aggregation_threads.max(1))),
        }
    }

    /// Execute one read
    pub async fn query(&self, query: ReadQuery) -> Result<Series> {
        query.validate(self.max_intervals)?;
        let start = Instant::now();

        let entries = if query.aggregation == Aggregation::None {
            self.read_raw(&query).await?
        } else {
            self.read_aggregated(&query).await?
        };

        debug!(
            "Query {} of {} returned {} entries in {:?}",
            query.key,
            query.entity_id,
            entries.len(),
            start.elapsed()
        );
        Ok(Series::new(&query, entries))
    }

    /// Execute several reads of one entity concurrently
    pub async fn query_all(&self, queries: Vec<ReadQuery>) -> Result<Vec<Series>> {
        for q in &queries {
            q.validate(self.max_intervals)?;
        }

        let mut tasks = JoinSet::new();
        for (index, q) in queries.into_iter().enumerate() {
            let engine = self.clone();
            tasks.spawn(async move { (index, engine.query(q).await) });
        }

        let mut results = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            let (index, series) =
                joined.map_err(|e| SenseError::Internal(format!("query task failed: {}", e)))?;
            results.push((index, series?));
        }
        results.sort_by_key(|(index, _)| *index);

        Ok(results.into_iter().map(|(_, s)| s).collect())
    }

    /// Latest values of `keys`
    pub async fn find_latest(&self, entity_id: EntityId, keys: Vec<String>) -> Result<Vec<TsKvEntry>> {
        let store = self.store.clone();
        run_blocking(move || store.find_latest(entity_id, &keys)).await
    }

    /// The frame a device uploaded at exactly `ts`
    pub async fn find_telemetry_image(&self, device_id: Uuid, ts: Timestamp) -> Result<Option<TsKvEntry>> {
        let entity_id = EntityId::device(device_id);
        let query = ReadQuery::raw(entity_id, IMAGE_KEY, ts, ts.saturating_add(1)).with_limit(1);
        let series = self.query(query).await?;
        Ok(series.entries.into_iter().next())
    }

    async fn read_raw(&self, query: &ReadQuery) -> Result<Vec<TsKvEntry>> {
        let store = self.store.clone();
        let (entity_id, key, range, limit, order) = (
            query.entity_id,
            query.key.clone(),
            query.range(),
            query.limit,
            query.order,
        );
        run_blocking(move || store.find_range(entity_id, &key, range, limit, order)).await
    }

    async fn read_aggregated(&self, query: &ReadQuery) -> Result<Vec<TsKvEntry>> {
        let mut tasks = JoinSet::new();
        for (index, range) in query.sub_intervals().into_iter().enumerate() {
            let store = self.store.clone();
            let permits = self.permits.clone();
            let (entity_id, key, aggregation) = (query.entity_id, query.key.clone(), query.aggregation);

            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|e| SenseError::Internal(e.to_string()))?;
                let point = run_blocking(move || {
                    let rows = store.find_range(entity_id, &key, range, usize::MAX, SortOrder::Asc)?;
                    Ok(aggregate(aggregation, &rows).map(|value| TsKvEntry {
                        key,
                        ts: range.midpoint(),
                        value,
                    }))
                })
                .await?;
                Ok::<_, SenseError>((index, point))
            });
        }

        let mut points = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            let (index, point) =
                joined.map_err(|e| SenseError::Internal(format!("aggregation task failed: {}", e)))??;
            if let Some(point) = point {
                points.push((index, point));
            }
        }
        points.sort_by_key(|(index, _)| *index);

        Ok(points.into_iter().map(|(_, p)| p).collect())
    }
}

/// Run a store call on the blocking pool
async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SenseError::Internal(format!("store task failed: {}", e)))?
}

impl std::fmt::Debug for QueryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryEngine")
            .field("max_intervals", &self.max_intervals)
            .field("available_permits", &self.permits.available_permits())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryTimeseriesStore;
    use crate::{KvValue, TimeseriesPoint};

    fn engine_with(points: &[(i64, KvValue)]) -> (QueryEngine, EntityId) {
        let store = Arc::new(MemoryTimeseriesStore::default());
        let entity = EntityId::device(Uuid::now_v7());
        let rows: Vec<_> = points
            .iter()
            .map(|(ts, v)| TimeseriesPoint::from_entry(entity, &TsKvEntry::new("temp", *ts, v.clone())))
            .collect();
        store.save_batch(&rows).unwrap();
        (QueryEngine::new(store, &QueryConfig::default()), entity)
    }

    #[tokio::test]
    async fn test_raw_read_desc_with_limit() {
        let (engine, entity) = engine_with(&[(1, 1i64.into()), (2, 2i64.into()), (3, 3i64.into())]);
        let series = engine
            .query(ReadQuery::raw(entity, "temp", 0, 10).with_limit(2).with_order(SortOrder::Desc))
            .await
            .unwrap();

        assert_eq!(series.entries.iter().map(|e| e.ts).collect::<Vec<_>>(), vec![3, 2]);
        assert_eq!(series.last_ts, 3);
    }

    #[tokio::test]
    async fn test_empty_sub_intervals_are_omitted() {
        let (engine, entity) = engine_with(&[(100, 1.0.into()), (2500, 3.0.into()), (2600, 5.0.into())]);
        let series = engine
            .query(ReadQuery::aggregated(entity, "temp", 0, 3000, 1000, Aggregation::Avg))
            .await
            .unwrap();

        assert_eq!(series.len(), 2);
        assert_eq!(series.entries[0].ts, 500);
        assert_eq!(series.entries[1].ts, 2500);
        assert_eq!(series.entries[1].value, KvValue::Double(4.0));
    }

    #[tokio::test]
    async fn test_latest_and_image_lookups() {
        let store = Arc::new(MemoryTimeseriesStore::default());
        let device = Uuid::now_v7();
        let entity = EntityId::device(device);
        for (ts, frame) in [(10, "a"), (20, "b")] {
            let entry = TsKvEntry::new(IMAGE_KEY, ts, frame);
            store.save_batch(&[TimeseriesPoint::from_entry(entity, &entry)]).unwrap();
            store.save_latest(entity, &entry).unwrap();
        }
        let engine = QueryEngine::new(store, &QueryConfig::default());

        let keys = vec![IMAGE_KEY.to_string(), "missing".to_string()];
        let latest = engine.find_latest(entity, keys).await.unwrap();
        assert_eq!(latest, vec![TsKvEntry::new(IMAGE_KEY, 20, "b")]);

        let frame = engine.find_telemetry_image(device, 10).await.unwrap();
        assert_eq!(frame.map(|e| e.value), Some(KvValue::from("a")));
        assert_eq!(engine.find_telemetry_image(device, 15).await.unwrap(), None);
        assert_eq!(engine.find_telemetry_image(device, i64::MAX).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_query_rejected() {
        let (engine, entity) = engine_with(&[]);
        let err = engine
            .query(ReadQuery::aggregated(entity, "temp", 0, 10_000_000, 1, Aggregation::Max))
            .await
            .unwrap_err();
        assert!(err.is_caller_error());
        assert!(err.to_string().contains("10000"));
    }
}
