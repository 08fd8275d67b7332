//! Telemetry ingestion
//!
//! One device batch fans out into latest-value upserts, historical points
//! and per-capability recognition records. Historical and
//! recognition writes go through the batch queues; the call resolves once
//! every one of them has been flushed.

mod msg;
mod payload;

pub use msg::{TelemetryExtData, TelemetryMsg, EXT_DATA_FIELD, POST_TELEMETRY_REQUEST, TTL_METADATA_KEY};
pub use payload::parse_telemetry;

use crate::config::QueueConfig;
use crate::queue::{BatchQueue, FlushTicket};
use crate::retention::RetentionState;
use crate::store::{
    AttributeScope, AttributeStore, CapabilityStore, MemoryStores, RecognitionSink, TimeseriesSink,
    TimeseriesStore,
};
use crate::{
    now_millis, AbilityType, CapabilityKind, DeviceCapability, EntityId, KvValue,
    RecognitionRecord, RecognitionSummary, Result, SenseError, TenantId, TimeseriesPoint, Timestamp,
    TsKvEntry, IMAGE_KEY,
};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

/// Keys dropped before any write: firmware and software update state
pub const EXCLUDED_KEYS: [&str; 10] = [
    "fw_state",
    "target_fw_title",
    "target_fw_version",
    "target_fw_tag",
    "target_fw_ts",
    "sw_state",
    "target_sw_title",
    "target_sw_version",
    "target_sw_tag",
    "target_sw_ts",
];

/// Server-scope attribute holding the timestamp of a device's last batch
pub const LAST_ACTIVITY_TIME: &str = "lastActivityTime";

/// Result of one ingested batch
#[derive(Debug, Clone, Default)]
pub struct IngestReport {
    /// Rows written: one per historical point and recognition row
    pub rows: usize,
    /// Image recognition records derived from this batch, except the ones
    /// for the `image` capability itself
    pub recognitions: Vec<RecognitionRecord>,
}

/// Fans telemetry batches out to the stores
pub struct TelemetryIngestor {
    state: Arc<RetentionState>,
    timeseries: Arc<dyn TimeseriesStore>,
    capabilities: Arc<dyn CapabilityStore>,
    attributes: Arc<dyn AttributeStore>,
    points: BatchQueue<TimeseriesPoint>,
    recognitions: BatchQueue<RecognitionRecord>,
}

impl TelemetryIngestor {
    pub fn new(
        state: Arc<RetentionState>,
        timeseries: Arc<dyn TimeseriesStore>,
        capabilities: Arc<dyn CapabilityStore>,
        attributes: Arc<dyn AttributeStore>,
        points: BatchQueue<TimeseriesPoint>,
        recognitions: BatchQueue<RecognitionRecord>,
    ) -> Self {
        Self {
            state,
            timeseries,
            capabilities,
            attributes,
            points,
            recognitions,
        }
    }

    /// Start both queues in front of the in-memory stores
    pub fn start(config: &QueueConfig, stores: &MemoryStores, state: Arc<RetentionState>) -> Self {
        let points = BatchQueue::start(
            "timeseries",
            config,
            Arc::new(TimeseriesSink(stores.timeseries.clone())),
        );
        let recognitions = BatchQueue::start(
            "recognition",
            config,
            Arc::new(RecognitionSink(stores.recognitions.clone())),
        );
        Self::new(
            state,
            stores.timeseries.clone(),
            stores.capabilities.clone(),
            stores.attributes.clone(),
            points,
            recognitions,
        )
    }

    pub fn points_queue(&self) -> &BatchQueue<TimeseriesPoint> {
        &self.points
    }

    pub fn recognition_queue(&self) -> &BatchQueue<RecognitionRecord> {
        &self.recognitions
    }

    /// Flush everything pending and stop both queues
    pub async fn shutdown(&self) {
        self.points.shutdown().await;
        self.recognitions.shutdown().await;
    }

    /// Ingest one batch, returning rows written
    pub async fn ingest(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        entries: Vec<TsKvEntry>,
        ttl: i64,
        save_latest: bool,
    ) -> Result<usize> {
        self.ingest_batch(tenant_id, entity_id, entries, ttl, save_latest)
            .await
            .map(|report| report.rows)
    }

    /// Ingest one batch, also returning the derived image recognitions
    pub async fn ingest_batch(
        &self,
        tenant_id: TenantId,
        entity_id: EntityId,
        entries: Vec<TsKvEntry>,
        ttl: i64,
        save_latest: bool,
    ) -> Result<IngestReport> {
        validate(entity_id, &entries)?;
        self.check_admission(entity_id)?;

        if !entity_id.is_device() {
            if save_latest {
                for entry in &entries {
                    self.timeseries.save_latest(entity_id, entry)?;
                }
            }
            return Ok(IngestReport::default());
        }

        let start = Instant::now();
        let device_id = entity_id.id;
        let mut tickets: Vec<FlushTicket> = Vec::new();
        let mut image_keys: Vec<&str> = Vec::new();
        let mut scalars: Vec<&TsKvEntry> = Vec::new();
        let mut batch_ts: Timestamp = 0;

        for entry in &entries {
            // Excluded keys still move the activity timestamp
            batch_ts = entry.ts;
            if EXCLUDED_KEYS.contains(&entry.key.as_str()) {
                continue;
            }
            if save_latest {
                self.timeseries.save_latest(entity_id, entry)?;
            }
            tickets.push(self.points.submit(TimeseriesPoint::from_entry(entity_id, entry)).await?);
            if entry.key == IMAGE_KEY {
                self.state.record_image_write();
                image_keys.push(&entry.key);
            } else {
                scalars.push(entry);
            }
        }

        let capabilities = self.capabilities.find_by_device(device_id)?;
        let (images, others): (Vec<_>, Vec<_>) = capabilities
            .iter()
            .partition(|c| matches!(c.kind, CapabilityKind::Image { .. }));

        let mut in_batch = Vec::new();
        for _ in &image_keys {
            for capability in &images {
                let record = image_record(device_id, batch_ts, capability);
                if record.ability != IMAGE_KEY {
                    in_batch.push(record.clone());
                }
                tickets.push(self.recognitions.submit(record).await?);
            }
        }

        if scalars.is_empty() {
            debug!("No scalar telemetry for {} at {}", entity_id, batch_ts);
        } else {
            let mut known: HashSet<&str> = images
                .iter()
                .chain(others.iter())
                .map(|c| c.ability.as_str())
                .collect();
            // Last value of a repeated key wins
            let mut latest_scalar: HashMap<&str, &TsKvEntry> = HashMap::new();
            for &entry in &scalars {
                latest_scalar.insert(entry.key.as_str(), entry);
            }

            for (ability, entry) in latest_scalar {
                if known.insert(ability) {
                    self.capabilities
                        .create(DeviceCapability::scalar(device_id, ability))?;
                    info!("New scalar capability {} for device {}", ability, device_id);
                }
                let record = RecognitionRecord::new(
                    device_id,
                    batch_ts,
                    ability,
                    AbilityType::Scalar,
                    entry.value.value_as_string(),
                    None,
                );
                tickets.push(self.recognitions.submit(record).await?);
            }
        }

        self.attributes.save(
            entity_id,
            AttributeScope::ServerScope,
            LAST_ACTIVITY_TIME,
            KvValue::Long(batch_ts),
            now_millis(),
        )?;

        let submitted = tickets.len();
        let mut rows = 0;
        let mut failure = None;
        for ticket in tickets {
            match ticket.await {
                Ok(()) => rows += 1,
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        debug!(
            "Ingested {} entries for {} of tenant {} (ttl {}): {}/{} rows in {:?}",
            entries.len(),
            entity_id,
            tenant_id,
            ttl,
            rows,
            submitted,
            start.elapsed()
        );

        match failure {
            Some(e) => {
                error!("Failed to persist {} of {} rows for {}: {}", submitted - rows, submitted, entity_id, e);
                Err(e)
            }
            None => Ok(IngestReport {
                rows,
                recognitions: in_batch,
            }),
        }
    }

    /// Ingest a telemetry message, attaching `telemetryExtData` to image
    /// payloads of devices
    pub async fn ingest_msg(
        &self,
        tenant_id: TenantId,
        msg: &mut TelemetryMsg,
        default_ttl: i64,
        save_latest: bool,
    ) -> Result<usize> {
        self.check_admission(msg.originator)?;
        msg.strip_ext_data();

        if msg.msg_type != POST_TELEMETRY_REQUEST {
            return Err(SenseError::InvalidArgument(format!(
                "unsupported message type: {}",
                msg.msg_type
            )));
        }

        let entries = parse_telemetry(&msg.data, msg.metadata_ts())?;
        if entries.is_empty() {
            return Err(SenseError::InvalidArgument(format!(
                "message body is empty: {}",
                msg.data
            )));
        }
        let ttl = msg.ttl(default_ttl)?;

        let report = self
            .ingest_batch(tenant_id, msg.originator, entries, ttl, save_latest)
            .await?;

        if msg.originator.is_device() && msg.has_field(IMAGE_KEY) {
            if report.recognitions.is_empty() {
                debug!("No image recognitions for {} at {}", msg.originator, msg.ts);
            } else {
                let mut device_info = msg.metadata.clone();
                device_info.insert("deviceId".to_string(), msg.originator.id.to_string());
                let ext = TelemetryExtData {
                    device_info,
                    telemetry_recognition_thirds: report
                        .recognitions
                        .iter()
                        .map(RecognitionSummary::from)
                        .collect(),
                };
                msg.attach_ext_data(&ext)?;
            }
        }

        Ok(report.rows)
    }

    fn check_admission(&self, entity_id: EntityId) -> Result<()> {
        if self.state.can_save_data() {
            return Ok(());
        }
        error!("Free space below the floor, cannot save data for {}", entity_id);
        Err(SenseError::AdmissionRejected(format!(
            "free space below the floor, cannot save data for {}",
            entity_id
        )))
    }
}

fn validate(entity_id: EntityId, entries: &[TsKvEntry]) -> Result<()> {
    if !entity_id.kind.is_writable() {
        return Err(SenseError::InvalidArgument(format!(
            "cannot write to this entity kind: {}",
            entity_id.kind
        )));
    }
    if entries.iter().any(|e| e.key.trim().is_empty()) {
        return Err(SenseError::InvalidArgument(
            "Key value entry can't be null or blank".into(),
        ));
    }
    Ok(())
}

/// Placeholder recognition for one image capability: every declared
/// attribute mapped to an empty string
fn image_record(device_id: uuid::Uuid, ts: Timestamp, capability: &DeviceCapability) -> RecognitionRecord {
    let (attributes, extra_info) = match &capability.kind {
        CapabilityKind::Image {
            attributes,
            extra_info,
        } => (attributes.as_slice(), extra_info.clone()),
        CapabilityKind::Scalar => (&[][..], None),
    };
    let value: Map<String, Value> = attributes
        .iter()
        .map(|a| (a.clone(), Value::String(String::new())))
        .collect();

    RecognitionRecord::new(
        device_id,
        ts,
        capability.ability.clone(),
        capability.kind.ability_type(),
        Value::Object(value).to_string(),
        extra_info,
    )
}
