//! Batched write-behind queue
//!
//! Items are routed to one of `N` shards by a caller-supplied hash. Each
//! shard owns a bounded backlog and a flush task that collects up to
//! `batch_size` items (or whatever arrived within `max_batch_delay_ms` of the
//! first one), sorts them, and hands the batch to a [`BatchSink`] in one call.
//!
//! Callers get a [`FlushTicket`] per item that resolves once the batch
//! holding it was persisted, or with the batch's failure.

mod shard;
mod stats;

pub use stats::{QueueStats, QueueStatsSnapshot};

use crate::config::QueueConfig;
use crate::{RecognitionRecord, Result, SenseError, TimeseriesPoint};
use parking_lot::{Mutex, RwLock};
use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// An item that can travel through a [`BatchQueue`]
pub trait Batched: Send + 'static {
    /// Hash selecting the shard; equal natural keys must hash equally
    fn shard_hash(&self) -> u64;

    /// Total order applied to every flushed batch
    fn batch_cmp(&self, other: &Self) -> Ordering;
}

/// Destination of flushed batches
pub trait BatchSink<T>: Send + Sync + 'static {
    /// Persist the whole batch, returning rows affected
    fn flush(&self, batch: &[T]) -> Result<usize>;
}

impl Batched for TimeseriesPoint {
    fn shard_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.entity_id.hash(&mut hasher);
        hasher.finish()
    }

    fn batch_cmp(&self, other: &Self) -> Ordering {
        TimeseriesPoint::batch_cmp(self, other)
    }
}

impl Batched for RecognitionRecord {
    /// Hashes the natural key so updates of one row always meet in one shard
    fn shard_hash(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.device_id.hash(&mut hasher);
        self.ts.hash(&mut hasher);
        self.ability.hash(&mut hasher);
        hasher.finish()
    }

    fn batch_cmp(&self, other: &Self) -> Ordering {
        RecognitionRecord::batch_cmp(self, other)
    }
}

/// Shard index for a hash
pub fn shard_index(hash: u64, shards: usize) -> usize {
    ((hash & 0x7FFF_FFFF) % shards as u64) as usize
}

/// Resolves once the item's batch has been flushed
#[must_use = "a ticket does nothing unless awaited"]
#[derive(Debug)]
pub struct FlushTicket {
    rx: oneshot::Receiver<Result<()>>,
}

impl Future for FlushTicket {
    type Output = Result<()>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            Err(_) => Err(SenseError::Persistence(
                "queue shard stopped before flushing".into(),
            )),
        })
    }
}

/// A queued item and the channel its outcome goes back on
pub(crate) struct Pending<T> {
    pub(crate) item: T,
    pub(crate) done: oneshot::Sender<Result<()>>,
}

/// Hash-sharded write-behind queue
pub struct BatchQueue<T: Batched> {
    name: String,
    senders: RwLock<Option<Vec<mpsc::Sender<Pending<T>>>>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<QueueStats>,
    cancel: CancellationToken,
}

impl<T: Batched> BatchQueue<T> {
    /// Start the shard tasks. Must be called from within a tokio runtime.
    pub fn start(name: impl Into<String>, config: &QueueConfig, sink: Arc<dyn BatchSink<T>>) -> Self {
        let name = name.into();
        let stats = Arc::new(QueueStats::default());
        let cancel = CancellationToken::new();
        let shards = config.shard_threads.max(1);

        let mut senders = Vec::with_capacity(shards);
        let mut handles = Vec::with_capacity(shards + 1);
        for index in 0..shards {
            let (tx, rx) = mpsc::channel(config.backlog_capacity.max(1));
            let worker = shard::ShardWorker {
                queue: name.clone(),
                index,
                batch_size: config.batch_size.max(1),
                max_delay: Duration::from_millis(config.max_batch_delay_ms),
                sort: config.batch_sort_enabled,
                sink: sink.clone(),
                stats: stats.clone(),
            };
            handles.push(tokio::spawn(worker.run(rx)));
            senders.push(tx);
        }

        if config.stats_print_interval_ms > 0 {
            handles.push(tokio::spawn(stats::print_periodically(
                name.clone(),
                stats.clone(),
                Duration::from_millis(config.stats_print_interval_ms),
                cancel.clone(),
            )));
        }

        info!("Started queue {} with {} shards", name, shards);

        Self {
            name,
            senders: RwLock::new(Some(senders)),
            handles: Mutex::new(handles),
            stats,
            cancel,
        }
    }

    /// Admit an item to its shard's backlog.
    ///
    /// Waits while the backlog is full. The returned ticket resolves on
    /// persistence.
    pub async fn submit(&self, item: T) -> Result<FlushTicket> {
        let tx = {
            let senders = self.senders.read();
            match senders.as_ref() {
                Some(senders) => {
                    senders[shard_index(item.shard_hash(), senders.len())].clone()
                }
                None => return Err(SenseError::Persistence("queue closed".into())),
            }
        };

        let (done, rx) = oneshot::channel();
        tx.send(Pending { item, done })
            .await
            .map_err(|_| SenseError::Persistence("queue closed".into()))?;
        self.stats.record_enqueued();

        Ok(FlushTicket { rx })
    }

    /// Enqueue an item and wait until it has been persisted
    pub async fn enqueue(&self, item: T) -> Result<()> {
        self.submit(item).await?.await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of shards, zero after shutdown
    pub fn shard_count(&self) -> usize {
        self.senders.read().as_ref().map_or(0, Vec::len)
    }

    /// Current counters
    pub fn stats(&self) -> QueueStatsSnapshot {
        self.stats.snapshot()
    }

    /// Stop admission, drain every shard and wait for the flush tasks
    pub async fn shutdown(&self) {
        let senders = self.senders.write().take();
        if senders.is_none() {
            return;
        }
        drop(senders);
        self.cancel.cancel();

        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        for handle in handles {
            if let Err(e) = handle.await {
                debug!("Queue {} task ended abnormally: {}", self.name, e);
            }
        }

        let stats = self.stats.snapshot();
        info!(
            "Queue {} stopped: enqueued={}, persisted={}, failed={}, batches={}",
            self.name, stats.enqueued, stats.persisted, stats.failed, stats.batches
        );
    }
}
