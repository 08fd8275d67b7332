//! JSON telemetry payloads
//!
//! Accepted shapes:
//!
//! ```text
//! {"temp": 21.5, "door": true}
//! {"ts": 1700000000000, "values": {"temp": 21.5}}
//! [{"ts": 1700000000000, "values": {"temp": 21.5}}, {"hum": 40}]
//! ```

use crate::{KvValue, Result, SenseError, Timestamp, TsKvEntry};
use serde_json::{Map, Value};

/// Parse a payload into points. Entries without their own `ts` are stamped
/// with `default_ts`.
pub fn parse_telemetry(data: &str, default_ts: Timestamp) -> Result<Vec<TsKvEntry>> {
    let json: Value = serde_json::from_str(data)
        .map_err(|e| SenseError::InvalidArgument(format!("payload is not valid JSON: {}", e)))?;

    let mut entries = Vec::new();
    match json {
        Value::Array(items) => {
            for item in items {
                match item {
                    Value::Object(obj) => parse_object(obj, default_ts, &mut entries)?,
                    other => {
                        return Err(SenseError::InvalidArgument(format!(
                            "payload array element must be an object, got {}",
                            other
                        )))
                    }
                }
            }
        }
        Value::Object(obj) => parse_object(obj, default_ts, &mut entries)?,
        other => {
            return Err(SenseError::InvalidArgument(format!(
                "payload must be an object or an array, got {}",
                other
            )))
        }
    }
    Ok(entries)
}

fn parse_object(mut obj: Map<String, Value>, default_ts: Timestamp, out: &mut Vec<TsKvEntry>) -> Result<()> {
    let stamped = obj.len() == 2 && obj.contains_key("ts") && obj.contains_key("values");
    if !stamped {
        push_values(obj, default_ts, out);
        return Ok(());
    }

    let ts = obj
        .get("ts")
        .and_then(Value::as_i64)
        .ok_or_else(|| SenseError::InvalidArgument("payload ts must be an integer".into()))?;
    match obj.remove("values") {
        Some(Value::Object(values)) => {
            push_values(values, ts, out);
            Ok(())
        }
        _ => Err(SenseError::InvalidArgument(
            "payload values must be an object".into(),
        )),
    }
}

fn push_values(values: Map<String, Value>, ts: Timestamp, out: &mut Vec<TsKvEntry>) {
    for (key, value) in values {
        if let Some(value) = to_kv(value) {
            out.push(TsKvEntry::new(key, ts, value));
        }
    }
}

/// `None` for JSON null
fn to_kv(value: Value) -> Option<KvValue> {
    match value {
        Value::Null => None,
        Value::Bool(b) => Some(KvValue::Boolean(b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Some(KvValue::Long(i)),
            None => n.as_f64().map(KvValue::Double),
        },
        Value::String(s) => Some(KvValue::String(s)),
        nested @ (Value::Array(_) | Value::Object(_)) => Some(KvValue::Json(nested.to_string())),
    }
}
