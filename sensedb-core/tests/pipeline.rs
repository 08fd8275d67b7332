//! Ingestion, query and snapshot tests against the in-memory stores.

use sensedb_core::config::{QueryConfig, QueueConfig};
use sensedb_core::ingest::TelemetryIngestor;
use sensedb_core::query::{QueryEngine, ReadQuery};
use sensedb_core::retention::RetentionState;
use sensedb_core::store::{
    CapabilityStore, MemoryStores, RecognitionStore, StoreSnapshot, TimeseriesStore, SNAPSHOT_FILE,
};
use sensedb_core::{
    AbilityType, Aggregation, DeviceCapability, EntityId, KvValue, RecognitionRecord, SenseError,
    TimeseriesPoint, TsKvEntry, IMAGE_KEY,
};
use uuid::Uuid;

fn queue_config() -> QueueConfig {
    QueueConfig {
        max_batch_delay_ms: 5,
        stats_print_interval_ms: 0,
        ..Default::default()
    }
}

fn engine(stores: &MemoryStores, max_intervals: i64) -> QueryEngine {
    let config = QueryConfig {
        max_aggregation_intervals: max_intervals,
        ..Default::default()
    };
    QueryEngine::new(stores.timeseries.clone(), &config)
}

#[tokio::test]
async fn image_and_scalar_batch_round_trip() {
    let stores = MemoryStores::new();
    let state = RetentionState::new();
    let ingestor = TelemetryIngestor::start(&queue_config(), &stores, state.clone());

    let device = Uuid::now_v7();
    let entity = EntityId::device(device);
    stores
        .capabilities
        .create(DeviceCapability::image(device, "plate", vec!["number".into()], None))
        .unwrap();
    stores
        .capabilities
        .create(DeviceCapability::scalar(device, "temp"))
        .unwrap();

    let ts = 1_700_000_000_000;
    let entries = vec![
        TsKvEntry::new(IMAGE_KEY, ts, "frame-bytes"),
        TsKvEntry::new("temp", ts, 21.5),
    ];
    let rows = ingestor.ingest(Uuid::nil(), entity, entries, 0, true).await.unwrap();
    // image and temp points, plate and temp recognitions
    assert_eq!(rows, 4);
    assert_eq!(stores.recognitions.len(), 2);
    assert_eq!(stores.recognitions.get(device, ts, "plate").unwrap().ability_type, AbilityType::Image);
    assert_eq!(stores.recognitions.get(device, ts, "temp").unwrap().value, "21.5");

    let engine = engine(&stores, 700);
    let series = engine.query(ReadQuery::raw(entity, "temp", ts, ts + 1)).await.unwrap();
    assert_eq!(series.entries, vec![TsKvEntry::new("temp", ts, 21.5)]);
    assert_eq!(series.last_ts, ts);

    let latest = engine.find_latest(entity, vec!["temp".to_string()]).await.unwrap();
    assert_eq!(latest, vec![TsKvEntry::new("temp", ts, 21.5)]);

    let frame = engine.find_telemetry_image(device, ts).await.unwrap();
    assert_eq!(frame, Some(TsKvEntry::new(IMAGE_KEY, ts, "frame-bytes")));
    assert_eq!(engine.find_telemetry_image(device, ts + 1).await.unwrap(), None);

    ingestor.shutdown().await;
}

#[tokio::test]
async fn admission_gate_blocks_then_allows() {
    let stores = MemoryStores::new();
    let state = RetentionState::new();
    let ingestor = TelemetryIngestor::start(&queue_config(), &stores, state.clone());
    let entity = EntityId::device(Uuid::now_v7());
    let batch = || vec![TsKvEntry::new(IMAGE_KEY, 10, "f"), TsKvEntry::new("door", 10, true)];

    state.set_can_save_data(false);
    let err = ingestor.ingest(Uuid::nil(), entity, batch(), 0, true).await.unwrap_err();
    assert!(matches!(err, SenseError::AdmissionRejected(_)));
    assert!(stores.timeseries.is_empty());
    assert!(stores.recognitions.is_empty());
    assert!(stores.timeseries.find_latest(entity, &["door".to_string()]).unwrap().is_empty());

    state.set_can_save_data(true);
    let rows = ingestor.ingest(Uuid::nil(), entity, batch(), 0, true).await.unwrap();
    // image and door points, door recognition
    assert_eq!(rows, 3);
    assert_eq!(stores.timeseries.len(), 2);

    ingestor.shutdown().await;
}

#[test]
fn repeated_recognition_keeps_one_row() {
    let stores = MemoryStores::new();
    let device = Uuid::now_v7();
    let first = RecognitionRecord::new(device, 5, "temp", AbilityType::Scalar, "1", None);
    let second = RecognitionRecord::new(device, 5, "temp", AbilityType::Scalar, "2", None);

    stores.recognitions.upsert_batch(&[first]).unwrap();
    stores.recognitions.upsert_batch(&[second.clone()]).unwrap();

    assert_eq!(stores.recognitions.len(), 1);
    let stored = stores.recognitions.get(device, 5, "temp").unwrap();
    assert_eq!(stored.value, "2");
    assert_eq!(stored.id, second.id);
}

#[tokio::test]
async fn max_falls_back_to_strings_per_interval() {
    let stores = MemoryStores::new();
    let entity = EntityId::device(Uuid::now_v7());
    let points: Vec<_> = [
        TsKvEntry::new("reading", 100, 3i64),
        TsKvEntry::new("reading", 200, 7i64),
        TsKvEntry::new("reading", 1_100, "alpha"),
        TsKvEntry::new("reading", 1_200, "beta"),
    ]
    .iter()
    .map(|e| TimeseriesPoint::from_entry(entity, e))
    .collect();
    stores.timeseries.save_batch(&points).unwrap();

    let series = engine(&stores, 700)
        .query(ReadQuery::aggregated(entity, "reading", 0, 2_000, 1_000, Aggregation::Max))
        .await
        .unwrap();

    assert_eq!(series.len(), 2);
    assert_eq!(series.entries[0].ts, 500);
    assert_eq!(series.entries[0].value, KvValue::Long(7));
    assert_eq!(series.entries[1].ts, 1_500);
    assert_eq!(series.entries[1].value, KvValue::String("beta".into()));
}

#[tokio::test]
async fn interval_guard_rejects_before_store_access() {
    let stores = MemoryStores::new();
    let entity = EntityId::device(Uuid::now_v7());
    let err = engine(&stores, 1_000)
        .query(ReadQuery::aggregated(entity, "temp", 0, 10_000_000, 1, Aggregation::Avg))
        .await
        .unwrap_err();

    assert!(err.is_caller_error());
    assert!(err.to_string().contains("10000"));
}

#[tokio::test]
async fn snapshot_survives_restart_and_detects_corruption() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join(SNAPSHOT_FILE);

    let stores = MemoryStores::new();
    let state = RetentionState::new();
    let ingestor = TelemetryIngestor::start(&queue_config(), &stores, state);
    let device = Uuid::now_v7();
    for ts in 0..50 {
        let entries = vec![
            TsKvEntry::new(IMAGE_KEY, ts, format!("frame-{}", ts)),
            TsKvEntry::new("temp", ts, ts as f64),
        ];
        ingestor
            .ingest(Uuid::nil(), EntityId::device(device), entries, 0, true)
            .await
            .unwrap();
    }
    ingestor.shutdown().await;
    stores.save(&path).unwrap();

    let restored = MemoryStores::new();
    assert!(restored.load(&path).unwrap());
    assert_eq!(restored.timeseries.len(), 100);
    assert_eq!(restored.recognitions.len(), 50);
    assert_eq!(
        restored.capabilities.find_by_device(device).unwrap(),
        stores.capabilities.find_by_device(device).unwrap()
    );

    let mut bytes = std::fs::read(&path).unwrap();
    let middle = bytes.len() / 2;
    bytes[middle] ^= 0xFF;
    let err = StoreSnapshot::decode(&bytes).unwrap_err();
    assert!(err.is_corruption());

    let missing = MemoryStores::new();
    assert!(!missing.load(dir.path().join("absent.snapshot")).unwrap());
}

#[tokio::test]
async fn query_all_keeps_input_order() {
    let stores = MemoryStores::new();
    let entity = EntityId::device(Uuid::now_v7());
    let points: Vec<_> = ["a", "b", "c"]
        .iter()
        .enumerate()
        .map(|(i, key)| TimeseriesPoint::from_entry(entity, &TsKvEntry::new(*key, i as i64, i as i64)))
        .collect();
    stores.timeseries.save_batch(&points).unwrap();

    let queries = ["c", "a", "b"]
        .iter()
        .map(|key| ReadQuery::raw(entity, *key, 0, 10))
        .collect();
    let series = engine(&stores, 700).query_all(queries).await.unwrap();
    let keys: Vec<_> = series.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["c", "a", "b"]);
    assert_eq!(series[0].entries[0].value, KvValue::Long(2));
}
