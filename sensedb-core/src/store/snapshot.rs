//! Snapshot persistence for the in-memory stores
//!
//! File format:
//! - 4 bytes: magic `SNDB`
//! - 1 byte: format version
//! - 8 bytes: payload length
//! - N bytes: payload (bincode, LZ4 with prepended size)
//! - 4 bytes: CRC32 of everything between the magic and the checksum

use super::{
    AttributeKv, MemoryAttributeStore, MemoryCapabilityStore, MemoryRecognitionStore,
    MemoryTimeseriesStore,
};
use crate::{
    now_millis, DeviceCapability, RecognitionRecord, Result, SenseError, TimeseriesPoint,
    Timestamp,
};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Snapshot file name inside the data directory
pub const SNAPSHOT_FILE: &str = "sensedb.snapshot";

const MAGIC: &[u8; 4] = b"SNDB";
const FORMAT_VERSION: u8 = 1;
const HEADER_LEN: usize = 4 + 1 + 8;

/// Contents of every in-memory store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub created_at: Timestamp,
    pub points: Vec<TimeseriesPoint>,
    pub latest: Vec<TimeseriesPoint>,
    pub recognitions: Vec<RecognitionRecord>,
    pub capabilities: Vec<DeviceCapability>,
    pub attributes: Vec<AttributeKv>,
}

impl StoreSnapshot {
    /// Serialize with header and checksum
    pub fn encode(&self) -> Result<Bytes> {
        let raw = bincode::serialize(self).map_err(|e| SenseError::InvalidFormat(e.to_string()))?;
        let payload = lz4_flex::compress_prepend_size(&raw);

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + 4);
        buf.put_slice(MAGIC);
        buf.put_u8(FORMAT_VERSION);
        buf.put_u64_le(payload.len() as u64);
        buf.put_slice(&payload);

        let checksum = crc32fast::hash(&buf[4..]);
        buf.put_u32_le(checksum);

        Ok(buf.freeze())
    }

    /// Deserialize, validating magic, version and checksum
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_LEN + 4 {
            return Err(SenseError::InvalidFormat("Snapshot too short".into()));
        }
        if &data[0..4] != MAGIC {
            return Err(SenseError::InvalidFormat("Not a snapshot file".into()));
        }

        let body = &data[4..data.len() - 4];
        let mut tail = &data[data.len() - 4..];
        let expected = tail.get_u32_le();
        let actual = crc32fast::hash(body);
        if expected != actual {
            return Err(SenseError::ChecksumMismatch { expected, actual });
        }

        let mut cursor = body;
        let version = cursor.get_u8();
        if version != FORMAT_VERSION {
            return Err(SenseError::InvalidFormat(format!(
                "Unsupported snapshot version: {}",
                version
            )));
        }
        let len = cursor.get_u64_le() as usize;
        if cursor.len() != len {
            return Err(SenseError::Corruption(format!(
                "Snapshot payload length {} does not match header {}",
                cursor.len(),
                len
            )));
        }

        let raw = lz4_flex::decompress_size_prepended(cursor)
            .map_err(|e| SenseError::Compression(e.to_string()))?;
        bincode::deserialize(&raw).map_err(|e| SenseError::InvalidFormat(e.to_string()))
    }
}

/// The in-memory stores, shared as one unit
#[derive(Clone, Default)]
pub struct MemoryStores {
    pub timeseries: Arc<MemoryTimeseriesStore>,
    pub recognitions: Arc<MemoryRecognitionStore>,
    pub capabilities: Arc<MemoryCapabilityStore>,
    pub attributes: Arc<MemoryAttributeStore>,
}

impl MemoryStores {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy every store
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            created_at: now_millis(),
            points: self.timeseries.export_points(),
            latest: self.timeseries.export_latest(),
            recognitions: self.recognitions.export(),
            capabilities: self.capabilities.export(),
            attributes: self.attributes.export(),
        }
    }

    /// Replace every store's contents
    pub fn restore(&self, snapshot: StoreSnapshot) {
        self.timeseries.restore(snapshot.points, snapshot.latest);
        self.recognitions.restore(snapshot.recognitions);
        self.capabilities.restore(snapshot.capabilities);
        self.attributes.restore(snapshot.attributes);
    }

    /// Write a snapshot file, replacing any previous one atomically
    pub fn save(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let bytes = self.snapshot().encode()?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, path)?;

        info!("Wrote snapshot {} ({} bytes)", path.display(), bytes.len());
        Ok(bytes.len() as u64)
    }

    /// Restore from a snapshot file. Returns false when the file is absent.
    pub fn load(&self, path: impl AsRef<Path>) -> Result<bool> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(false);
        }

        let data = std::fs::read(path)?;
        let snapshot = StoreSnapshot::decode(&data)?;
        info!(
            "Loaded snapshot {}: {} points, {} recognition records, {} capabilities",
            path.display(),
            snapshot.points.len(),
            snapshot.recognitions.len(),
            snapshot.capabilities.len()
        );
        self.restore(snapshot);
        Ok(true)
    }
}
