//! Telemetry messages and the extension data attached to them

use crate::{now_millis, EntityId, RecognitionSummary, Result, SenseError, Timestamp};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use uuid::Uuid;

/// The only message type accepted for telemetry
pub const POST_TELEMETRY_REQUEST: &str = "POST_TELEMETRY_REQUEST";

/// Payload field holding [`TelemetryExtData`]
pub const EXT_DATA_FIELD: &str = "telemetryExtData";

/// Metadata entry overriding the storage TTL, in seconds
pub const TTL_METADATA_KEY: &str = "TTL";

/// A telemetry message as it travels through the processing chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryMsg {
    pub id: Uuid,
    pub msg_type: String,
    pub originator: EntityId,
    pub ts: Timestamp,
    pub metadata: BTreeMap<String, String>,
    /// JSON payload
    pub data: String,
}

impl TelemetryMsg {
    pub fn new(originator: EntityId, data: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7(),
            msg_type: POST_TELEMETRY_REQUEST.to_string(),
            originator,
            ts: now_millis(),
            metadata: BTreeMap::new(),
            data: data.into(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Timestamp for points without their own: the `ts` metadata entry,
    /// falling back to the message timestamp
    pub fn metadata_ts(&self) -> Timestamp {
        self.metadata
            .get("ts")
            .and_then(|ts| ts.parse().ok())
            .unwrap_or(self.ts)
    }

    /// TTL from metadata, or `default_ttl` when absent or empty
    pub fn ttl(&self, default_ttl: i64) -> Result<i64> {
        match self.metadata.get(TTL_METADATA_KEY).map(|s| s.trim()) {
            Some(ttl) if !ttl.is_empty() => ttl.parse().map_err(|_| {
                SenseError::InvalidArgument(format!("TTL metadata is not a number: {}", ttl))
            }),
            _ => Ok(default_ttl),
        }
    }

    /// Whether the payload has a top-level `field`
    pub fn has_field(&self, field: &str) -> bool {
        matches!(self.payload_object(), Ok(obj) if obj.contains_key(field))
    }

    /// Set the `telemetryExtData` field of an object payload
    pub fn attach_ext_data(&mut self, ext: &TelemetryExtData) -> Result<()> {
        let mut obj = self.payload_object()?;
        let value = serde_json::to_value(ext)
            .map_err(|e| SenseError::Internal(format!("cannot encode ext data: {}", e)))?;
        obj.insert(EXT_DATA_FIELD.to_string(), value);
        self.data = Value::Object(obj).to_string();
        Ok(())
    }

    /// Remove a previously attached `telemetryExtData` field. Non-object
    /// payloads are left alone. Returns whether a field was removed.
    pub fn strip_ext_data(&mut self) -> bool {
        let Ok(mut obj) = self.payload_object() else {
            return false;
        };
        if obj.remove(EXT_DATA_FIELD).is_none() {
            return false;
        }
        self.data = Value::Object(obj).to_string();
        true
    }

    fn payload_object(&self) -> Result<Map<String, Value>> {
        match serde_json::from_str(&self.data) {
            Ok(Value::Object(obj)) => Ok(obj),
            Ok(_) => Err(SenseError::InvalidArgument(
                "payload is not a JSON object".into(),
            )),
            Err(e) => Err(SenseError::InvalidArgument(format!(
                "payload is not valid JSON: {}",
                e
            ))),
        }
    }
}

/// Device details and recognition summaries forwarded with an image payload
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryExtData {
    pub device_info: BTreeMap<String, String>,
    pub telemetry_recognition_thirds: Vec<RecognitionSummary>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(data: &str) -> TelemetryMsg {
        TelemetryMsg::new(EntityId::device(Uuid::now_v7()), data)
    }

    #[test]
    fn test_attach_then_strip() {
        let mut m = msg(r#"{"image": "abc"}"#);
        let mut ext = TelemetryExtData::default();
        ext.device_info.insert("deviceId".into(), "d1".into());

        m.attach_ext_data(&ext).unwrap();
        assert!(m.has_field(EXT_DATA_FIELD));
        let parsed: Value = serde_json::from_str(&m.data).unwrap();
        assert_eq!(parsed[EXT_DATA_FIELD]["deviceInfo"]["deviceId"], "d1");

        assert!(m.strip_ext_data());
        assert!(!m.has_field(EXT_DATA_FIELD));
        assert!(m.has_field("image"));
        assert!(!m.strip_ext_data());
    }

    #[test]
    fn test_ttl_metadata() {
        let m = msg("{}");
        assert_eq!(m.ttl(30).unwrap(), 30);
        assert_eq!(m.clone().with_metadata("TTL", "60").ttl(30).unwrap(), 60);
        assert_eq!(m.clone().with_metadata("TTL", "").ttl(30).unwrap(), 30);
        assert!(m.with_metadata("TTL", "soon").ttl(30).is_err());
    }

    #[test]
    fn test_metadata_ts() {
        let mut m = msg("{}");
        m.ts = 10;
        assert_eq!(m.metadata_ts(), 10);
        assert_eq!(m.with_metadata("ts", "20").metadata_ts(), 20);
    }

    #[test]
    fn test_attach_requires_object() {
        let mut m = msg("[1, 2]");
        assert!(m.attach_ext_data(&TelemetryExtData::default()).is_err());
        assert!(!m.strip_ext_data());
    }
}
