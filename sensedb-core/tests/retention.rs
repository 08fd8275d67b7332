//! Retention engine tests with a fixed space probe.

use sensedb_core::config::RetentionConfig;
use sensedb_core::retention::{
    Compactor, FixedProbe, NoopCompactor, RetentionEngine, RetentionState, TickOutcome,
};
use sensedb_core::store::{MemoryRecognitionStore, MemoryStores, RecognitionStore, TimeseriesStore};
use sensedb_core::{
    AbilityType, EntityId, RecognitionRecord, Result, TimeseriesPoint, Timestamp, TsKvEntry,
    IMAGE_KEY,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Default)]
struct CountingCompactor {
    runs: AtomicUsize,
}

impl Compactor for CountingCompactor {
    fn compact(&self) -> Result<()> {
        self.runs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Frames with a raw image point and one derived scalar row each
fn seed_frames(stores: &MemoryStores, device: Uuid, count: i64) {
    let entity = EntityId::device(device);
    let mut records = Vec::new();
    let mut points = Vec::new();
    for ts in 0..count {
        records.push(RecognitionRecord::new(device, ts, IMAGE_KEY, AbilityType::Image, "{}", None));
        records.push(RecognitionRecord::new(device, ts, "temp", AbilityType::Scalar, "20", None));
        points.push(TimeseriesPoint::from_entry(entity, &TsKvEntry::new(IMAGE_KEY, ts, "f")));
    }
    stores.recognitions.upsert_batch(&records).unwrap();
    stores.timeseries.save_batch(&points).unwrap();
}

fn config() -> RetentionConfig {
    RetentionConfig {
        limit_per_query: 3,
        strategy_rounds_per_sweep: 2,
        min_free_space_mb: 0,
        delete_round_count: 2,
        ..Default::default()
    }
}

fn engine(
    config: RetentionConfig,
    stores: &MemoryStores,
    probe: Arc<FixedProbe>,
    compactor: Arc<dyn Compactor>,
) -> RetentionEngine {
    RetentionEngine::new(
        config,
        RetentionState::new(),
        probe,
        compactor,
        stores.recognitions.clone(),
        stores.timeseries.clone(),
    )
}

#[tokio::test]
async fn sweeps_shrink_frames_until_space_recovers() {
    let stores = MemoryStores::new();
    seed_frames(&stores, Uuid::now_v7(), 10);
    let probe = Arc::new(FixedProbe::gb(9, 100));
    let compactor = Arc::new(CountingCompactor::default());
    let engine = engine(config(), &stores, probe.clone(), compactor.clone());

    let mut remaining = stores.recognitions.count_matching().unwrap();
    let mut free = 9;
    loop {
        let outcome = engine.run_tick().await.unwrap();
        let TickOutcome::Swept { deleted, .. } = outcome else {
            panic!("expected a sweep, got {:?}", outcome);
        };
        let now = stores.recognitions.count_matching().unwrap();
        if remaining == 0 {
            assert_eq!(deleted, 0);
            break;
        }
        assert!(now < remaining);
        assert_eq!(remaining - now, deleted);
        remaining = now;

        // Keep the volume shrinking so the next tick proceeds
        free -= 1;
        probe.set_available_gb(free);
    }

    // Derived rows and raw points go with their frame
    assert!(stores.recognitions.is_empty());
    assert!(stores.timeseries.is_empty());
    // Three sweeps with two needed: compacted after the second only
    assert_eq!(compactor.runs.load(Ordering::SeqCst), 1);

    probe.set_available_gb(50);
    assert_eq!(engine.run_tick().await.unwrap(), TickOutcome::Idle);
    let status = engine.state().status();
    assert_eq!(status.rounds_executed, 0);
    assert_eq!(status.rounds_needed, 0);
    assert_eq!(status.last_remain_disk_gb, 0);
    assert_eq!(status.deleted_count, 0);
    assert!(!status.running);
}

#[tokio::test]
async fn held_until_space_shrinks() {
    let stores = MemoryStores::new();
    seed_frames(&stores, Uuid::now_v7(), 20);
    let probe = Arc::new(FixedProbe::gb(5, 100));
    let engine = engine(config(), &stores, probe.clone(), Arc::new(NoopCompactor));

    assert!(matches!(engine.run_tick().await.unwrap(), TickOutcome::Swept { deleted: 6, .. }));
    assert_eq!(engine.run_tick().await.unwrap(), TickOutcome::Held);

    probe.set_available_gb(4);
    assert!(matches!(engine.run_tick().await.unwrap(), TickOutcome::Swept { deleted: 6, .. }));
}

#[tokio::test]
async fn image_writes_past_budget_trigger_sweep() {
    let stores = MemoryStores::new();
    seed_frames(&stores, Uuid::now_v7(), 20);
    let probe = Arc::new(FixedProbe::gb(5, 100));
    let engine = engine(config(), &stores, probe, Arc::new(NoopCompactor));

    engine.run_tick().await.unwrap();
    for _ in 0..7 {
        engine.state().record_image_write();
    }
    // 7 added > 3 * 2 allowed per sweep
    assert!(matches!(engine.run_tick().await.unwrap(), TickOutcome::Swept { .. }));
}

/// Recognition store recording the peak number of sweep calls in flight
struct GaugedRecognitions {
    inner: Arc<MemoryRecognitionStore>,
    active: AtomicUsize,
    peak: AtomicUsize,
}

impl GaugedRecognitions {
    fn new(inner: Arc<MemoryRecognitionStore>) -> Self {
        Self {
            inner,
            active: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn gauged<T>(&self, call: impl FnOnce() -> T) -> T {
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Widen the window another sweep would have to overlap in
        std::thread::sleep(Duration::from_millis(2));
        let result = call();
        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl RecognitionStore for GaugedRecognitions {
    fn upsert_batch(&self, records: &[RecognitionRecord]) -> Result<usize> {
        self.inner.upsert_batch(records)
    }

    fn find_oldest(&self, min_ts: Timestamp, limit: usize) -> Result<Vec<RecognitionRecord>> {
        self.gauged(|| self.inner.find_oldest(min_ts, limit))
    }

    fn min_ts(&self) -> Result<Option<Timestamp>> {
        self.inner.min_ts()
    }

    fn delete_by_ts_and_device(&self, ts: Timestamp, device_id: Uuid) -> Result<usize> {
        self.gauged(|| self.inner.delete_by_ts_and_device(ts, device_id))
    }

    fn count_matching(&self) -> Result<u64> {
        self.inner.count_matching()
    }

    fn find(
        &self,
        device_id: Uuid,
        ability: &str,
        start_ts: Timestamp,
        end_ts: Timestamp,
        limit: usize,
    ) -> Result<Vec<RecognitionRecord>> {
        self.inner.find(device_id, ability, start_ts, end_ts, limit)
    }

    fn delete_by_device(&self, device_id: Uuid) -> Result<usize> {
        self.inner.delete_by_device(device_id)
    }

    fn len(&self) -> usize {
        self.inner.len()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_ticks_run_one_sweep() {
    let stores = MemoryStores::new();
    seed_frames(&stores, Uuid::now_v7(), 6);
    let gauge = Arc::new(GaugedRecognitions::new(stores.recognitions.clone()));
    let engine = Arc::new(RetentionEngine::new(
        config(),
        RetentionState::new(),
        Arc::new(FixedProbe::gb(5, 100)),
        Arc::new(NoopCompactor),
        gauge.clone(),
        stores.timeseries.clone(),
    ));

    let mut ticks = JoinSet::new();
    for _ in 0..8 {
        let engine = engine.clone();
        ticks.spawn(async move { engine.run_tick().await.unwrap() });
    }

    let mut swept = 0;
    while let Some(outcome) = ticks.join_next().await {
        match outcome.unwrap() {
            TickOutcome::Swept { deleted, .. } => {
                swept += 1;
                assert_eq!(deleted, 6);
            }
            TickOutcome::Skipped | TickOutcome::Held => {}
            other => panic!("unexpected outcome {:?}", other),
        }
    }
    assert_eq!(swept, 1);
    assert_eq!(gauge.peak.load(Ordering::SeqCst), 1);
    assert!(stores.recognitions.is_empty());
    assert!(!engine.state().is_running());
}

#[tokio::test]
async fn floor_breach_blocks_admission() {
    let stores = MemoryStores::new();
    let config = RetentionConfig {
        min_free_space_mb: 1024,
        ..config()
    };
    let probe = Arc::new(FixedProbe::new(512 * 1024 * 1024, 100 * 1024 * 1024 * 1024));
    let engine = engine(config, &stores, probe, Arc::new(NoopCompactor));

    engine.run_tick().await.unwrap();
    assert!(!engine.state().can_save_data());
}

#[tokio::test]
async fn spawned_scheduler_stops_on_shutdown() {
    let stores = MemoryStores::new();
    seed_frames(&stores, Uuid::now_v7(), 3);
    let engine = Arc::new(engine(
        config(),
        &stores,
        Arc::new(FixedProbe::gb(5, 100)),
        Arc::new(NoopCompactor),
    ));

    let shutdown = CancellationToken::new();
    let handle = engine.clone().spawn(Duration::from_millis(20), shutdown.clone());

    tokio::time::timeout(Duration::from_secs(5), async {
        while !stores.recognitions.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    shutdown.cancel();
    handle.await.unwrap();
    assert!(!engine.state().is_running());
}
