//! Core types for SenseDB

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Tenant identifier
pub type TenantId = Uuid;

/// Telemetry key of the raw frame a device uploads
pub const IMAGE_KEY: &str = "image";

/// Current wall-clock time in milliseconds
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

/// Kind of entity a telemetry originator can be
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Device,
    Asset,
    Customer,
    Tenant,
    /// Read-only projection over another entity's telemetry
    EntityView,
}

impl EntityKind {
    /// Whether telemetry can be written for this kind
    pub fn is_writable(&self) -> bool {
        !matches!(self, EntityKind::EntityView)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EntityKind::Device => "DEVICE",
            EntityKind::Asset => "ASSET",
            EntityKind::Customer => "CUSTOMER",
            EntityKind::Tenant => "TENANT",
            EntityKind::EntityView => "ENTITY_VIEW",
        };
        f.write_str(s)
    }
}

/// Typed entity identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId {
    pub kind: EntityKind,
    pub id: Uuid,
}

impl EntityId {
    /// Create a new entity id
    pub fn new(kind: EntityKind, id: Uuid) -> Self {
        Self { kind, id }
    }

    /// Device entity id
    pub fn device(id: Uuid) -> Self {
        Self::new(EntityKind::Device, id)
    }

    pub fn is_device(&self) -> bool {
        self.kind == EntityKind::Device
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.kind, self.id)
    }
}

/// Possible telemetry value types
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum KvValue {
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
    /// Raw JSON text
    Json(String),
}

impl KvValue {
    pub fn is_numeric(&self) -> bool {
        matches!(self, KvValue::Long(_) | KvValue::Double(_))
    }

    /// Get as f64 if numeric
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            KvValue::Long(v) => Some(*v as f64),
            KvValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Get the string payload of a `String` value
    pub fn as_str(&self) -> Option<&str> {
        match self {
            KvValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Render the value the way it is stored in text columns
    pub fn value_as_string(&self) -> String {
        match self {
            KvValue::Boolean(v) => v.to_string(),
            KvValue::Long(v) => v.to_string(),
            KvValue::Double(v) => v.to_string(),
            KvValue::String(s) | KvValue::Json(s) => s.clone(),
        }
    }
}

impl From<f64> for KvValue {
    fn from(v: f64) -> Self {
        KvValue::Double(v)
    }
}

impl From<i64> for KvValue {
    fn from(v: i64) -> Self {
        KvValue::Long(v)
    }
}

impl From<bool> for KvValue {
    fn from(v: bool) -> Self {
        KvValue::Boolean(v)
    }
}

impl From<String> for KvValue {
    fn from(v: String) -> Self {
        KvValue::String(v)
    }
}

impl From<&str> for KvValue {
    fn from(v: &str) -> Self {
        KvValue::String(v.to_string())
    }
}

/// A single key/value sample as it arrives from a device
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TsKvEntry {
    pub key: String,
    pub ts: Timestamp,
    pub value: KvValue,
}

impl TsKvEntry {
    pub fn new(key: impl Into<String>, ts: Timestamp, value: impl Into<KvValue>) -> Self {
        Self {
            key: key.into(),
            ts,
            value: value.into(),
        }
    }
}

/// A stored telemetry point: `(entityId, key, ts, value)`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeseriesPoint {
    pub entity_id: EntityId,
    pub key: String,
    pub ts: Timestamp,
    pub value: KvValue,
}

impl TimeseriesPoint {
    /// Attach an entry to the entity it belongs to
    pub fn from_entry(entity_id: EntityId, entry: &TsKvEntry) -> Self {
        Self {
            entity_id,
            key: entry.key.clone(),
            ts: entry.ts,
            value: entry.value.clone(),
        }
    }

    /// Batch order: entity, key, ts
    pub fn batch_cmp(&self, other: &Self) -> Ordering {
        self.entity_id
            .cmp(&other.entity_id)
            .then_with(|| self.key.cmp(&other.key))
            .then_with(|| self.ts.cmp(&other.ts))
    }
}

/// Time range for queries, `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive)
    pub start: Timestamp,
    /// End timestamp (exclusive)
    pub end: Timestamp,
}

impl TimeRange {
    /// Create a new time range
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Representative timestamp of the range
    pub fn midpoint(&self) -> Timestamp {
        self.start + (self.end - self.start) / 2
    }
}

/// Sort order of raw reads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortOrder {
    #[default]
    Asc,
    Desc,
}

/// Aggregation functions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Aggregation {
    None,
    Avg,
    Min,
    Max,
    Sum,
    Count,
}

// ============================================================================
// Capabilities and recognition records
// ============================================================================

/// Storage encoding of a capability kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbilityType {
    Scalar,
    Image,
}

impl AbilityType {
    /// Numeric code used by the storage layer
    pub fn code(&self) -> i16 {
        match self {
            AbilityType::Scalar => 1,
            AbilityType::Image => 2,
        }
    }

    pub fn from_code(code: i16) -> Option<Self> {
        match code {
            1 => Some(AbilityType::Scalar),
            2 => Some(AbilityType::Image),
            _ => None,
        }
    }
}

/// What a capability reports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapabilityKind {
    /// A plain telemetry value, recorded verbatim
    Scalar,
    /// A region of an image frame to be recognized
    Image {
        /// Attribute names a recognition value carries
        attributes: Vec<String>,
        /// Static metadata, e.g. region coordinates `"11,12,13,14"`
        extra_info: Option<String>,
    },
}

impl CapabilityKind {
    pub fn ability_type(&self) -> AbilityType {
        match self {
            CapabilityKind::Scalar => AbilityType::Scalar,
            CapabilityKind::Image { .. } => AbilityType::Image,
        }
    }
}

/// Static description of what a device can report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCapability {
    pub id: Uuid,
    pub device_id: Uuid,
    pub ability: String,
    pub kind: CapabilityKind,
    pub created_time: Timestamp,
}

impl DeviceCapability {
    pub fn new(device_id: Uuid, ability: impl Into<String>, kind: CapabilityKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            device_id,
            ability: ability.into(),
            kind,
            created_time: now_millis(),
        }
    }

    /// Scalar capability discovered from an unseen telemetry key
    pub fn scalar(device_id: Uuid, ability: impl Into<String>) -> Self {
        Self::new(device_id, ability, CapabilityKind::Scalar)
    }

    pub fn image(
        device_id: Uuid,
        ability: impl Into<String>,
        attributes: Vec<String>,
        extra_info: Option<String>,
    ) -> Self {
        Self::new(
            device_id,
            ability,
            CapabilityKind::Image {
                attributes,
                extra_info,
            },
        )
    }
}

/// Natural key of a recognition record
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecognitionKey {
    pub ts: Timestamp,
    pub device_id: Uuid,
    pub ability: String,
}

/// A derived fact: a device exhibited `ability` with `value` at `ts`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecognitionRecord {
    pub id: Uuid,
    pub device_id: Uuid,
    pub ts: Timestamp,
    pub ability: String,
    pub ability_type: AbilityType,
    /// Literal value for scalar capabilities, JSON object text for image ones
    pub value: String,
    pub extra_info: Option<String>,
    pub created_time: Timestamp,
    pub updated_time: Timestamp,
}

impl RecognitionRecord {
    /// Create a record with a fresh time-ordered id
    pub fn new(
        device_id: Uuid,
        ts: Timestamp,
        ability: impl Into<String>,
        ability_type: AbilityType,
        value: impl Into<String>,
        extra_info: Option<String>,
    ) -> Self {
        let id = Uuid::now_v7();
        let now = now_millis();
        let created_time = id
            .get_timestamp()
            .map(|t| {
                let (secs, nanos) = t.to_unix();
                secs as i64 * 1000 + (nanos / 1_000_000) as i64
            })
            .unwrap_or(now);
        Self {
            id,
            device_id,
            ts,
            ability: ability.into(),
            ability_type,
            value: value.into(),
            extra_info,
            created_time,
            updated_time: now,
        }
    }

    pub fn key(&self) -> RecognitionKey {
        RecognitionKey {
            ts: self.ts,
            device_id: self.device_id,
            ability: self.ability.clone(),
        }
    }

    /// Batch order: ts, device, ability
    pub fn batch_cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.device_id.cmp(&other.device_id))
            .then_with(|| self.ability.cmp(&other.ability))
    }

    /// Whether retention deletes frames through this record
    pub fn is_frame(&self) -> bool {
        self.ability == IMAGE_KEY && self.ability_type == AbilityType::Image
    }
}

/// Recognition record as forwarded to downstream consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognitionSummary {
    pub id: String,
    pub ability: String,
    pub ability_type: i16,
    pub value: String,
    pub extra_info: Option<String>,
}

impl From<&RecognitionRecord> for RecognitionSummary {
    fn from(r: &RecognitionRecord) -> Self {
        Self {
            id: r.id.to_string(),
            ability: r.ability.clone(),
            ability_type: r.ability_type.code(),
            value: r.value.clone(),
            extra_info: r.extra_info.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_range_midpoint() {
        assert_eq!(TimeRange::new(100, 200).midpoint(), 150);
        assert_eq!(TimeRange::new(100, 101).midpoint(), 100);
        assert_eq!(TimeRange::new(-3, 3).midpoint(), 0);
    }

    #[test]
    fn test_kv_value() {
        let d = KvValue::Double(3.5);
        assert_eq!(d.as_f64(), Some(3.5));
        assert!(d.is_numeric());

        let l = KvValue::Long(42);
        assert_eq!(l.as_f64(), Some(42.0));
        assert_eq!(l.value_as_string(), "42");

        let s = KvValue::from("on");
        assert!(!s.is_numeric());
        assert_eq!(s.as_str(), Some("on"));
    }

    #[test]
    fn test_ability_type_codes() {
        assert_eq!(AbilityType::Scalar.code(), 1);
        assert_eq!(AbilityType::Image.code(), 2);
        assert_eq!(AbilityType::from_code(2), Some(AbilityType::Image));
        assert_eq!(AbilityType::from_code(7), None);
        assert_eq!(
            CapabilityKind::Image { attributes: vec![], extra_info: None }.ability_type(),
            AbilityType::Image
        );
    }

    #[test]
    fn test_recognition_batch_order() {
        let device = Uuid::now_v7();
        let a = RecognitionRecord::new(device, 10, "b", AbilityType::Scalar, "1", None);
        let b = RecognitionRecord::new(device, 10, "a", AbilityType::Scalar, "1", None);
        let c = RecognitionRecord::new(device, 5, "z", AbilityType::Scalar, "1", None);

        let mut batch = vec![a.clone(), b.clone(), c.clone()];
        batch.sort_by(RecognitionRecord::batch_cmp);
        assert_eq!(batch[0].ability, "z");
        assert_eq!(batch[1].ability, "a");
        assert_eq!(batch[2].ability, "b");
    }

    #[test]
    fn test_frame_record() {
        let device = Uuid::now_v7();
        let frame = RecognitionRecord::new(device, 1, IMAGE_KEY, AbilityType::Image, "{}", None);
        let roi = RecognitionRecord::new(device, 1, "plate", AbilityType::Image, "{}", None);
        assert!(frame.is_frame());
        assert!(!roi.is_frame());
        assert!(frame.created_time > 0);
    }
}
