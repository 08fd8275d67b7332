//! SenseDB Core - Device Telemetry Ingestion and Retention Engine
//!
//! Ingests high-volume device telemetry, persists it through a write-behind
//! batching layer, derives per-capability recognition records, and reclaims
//! storage when the underlying disk approaches capacity.
//!
//! # Architecture
//!
//! - **Queue**: hash-sharded batch queues in front of every store
//! - **Query**: windowed reads with AVG/MIN/MAX/SUM/COUNT aggregation
//! - **Ingest**: fans one device batch out to latest, historical and
//!   recognition writes, gated by admission control
//! - **Retention**: samples disk space and deletes the oldest frames while
//!   the volume is in the alarm zone
//! - **Store**: collaborator traits plus in-memory implementations with
//!   checksummed snapshots

pub mod config;
pub mod ingest;
pub mod query;
pub mod queue;
pub mod retention;
pub mod store;

mod error;
mod types;

pub use error::{Result, SenseError};
pub use types::*;

/// SenseDB version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
