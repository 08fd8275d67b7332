//! Queue counters

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Atomic counters shared by a queue's shards
#[derive(Debug, Default)]
pub struct QueueStats {
    enqueued: AtomicU64,
    persisted: AtomicU64,
    failed: AtomicU64,
    batches: AtomicU64,
}

/// Point-in-time copy of [`QueueStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatsSnapshot {
    pub enqueued: u64,
    pub persisted: u64,
    pub failed: u64,
    pub batches: u64,
}

impl QueueStatsSnapshot {
    /// Items admitted but not yet flushed
    pub fn pending(&self) -> u64 {
        self.enqueued.saturating_sub(self.persisted + self.failed)
    }
}

impl QueueStats {
    pub fn record_enqueued(&self) {
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self, persisted: u64, failed: u64) {
        self.persisted.fetch_add(persisted, Ordering::Relaxed);
        self.failed.fetch_add(failed, Ordering::Relaxed);
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            persisted: self.persisted.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
        }
    }
}

/// Log the counters every `period` while they keep changing
pub(crate) async fn print_periodically(
    queue: String,
    stats: Arc<QueueStats>,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.tick().await;
    let mut last = stats.snapshot();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let current = stats.snapshot();
                if current != last {
                    info!(
                        "Queue {}: enqueued={}, persisted={}, failed={}, batches={}, pending={}",
                        queue,
                        current.enqueued,
                        current.persisted,
                        current.failed,
                        current.batches,
                        current.pending()
                    );
                    last = current;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_count() {
        let stats = QueueStats::default();
        for _ in 0..5 {
            stats.record_enqueued();
        }
        stats.record_flush(2, 1);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.pending(), 2);
        assert_eq!(snapshot.batches, 1);
    }
}
