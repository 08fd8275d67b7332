//! Per-shard flush loop

use super::{BatchSink, Batched, Pending, QueueStats};
use crate::SenseError;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, error};

pub(crate) struct ShardWorker<T> {
    pub(crate) queue: String,
    pub(crate) index: usize,
    pub(crate) batch_size: usize,
    pub(crate) max_delay: Duration,
    pub(crate) sort: bool,
    pub(crate) sink: Arc<dyn BatchSink<T>>,
    pub(crate) stats: Arc<QueueStats>,
}

impl<T: Batched> ShardWorker<T> {
    /// Run until every sender is gone and the backlog is drained
    pub(crate) async fn run(self, mut rx: mpsc::Receiver<Pending<T>>) {
        debug!("Queue {} shard {} started", self.queue, self.index);

        let mut buffer: Vec<Pending<T>> = Vec::with_capacity(self.batch_size);
        loop {
            // Idle until the first item of the next batch
            match rx.recv().await {
                Some(pending) => buffer.push(pending),
                None => break,
            }

            let deadline = tokio::time::Instant::now() + self.max_delay;
            let mut closed = false;
            while buffer.len() < self.batch_size {
                match tokio::time::timeout_at(deadline, rx.recv()).await {
                    Ok(Some(pending)) => buffer.push(pending),
                    Ok(None) => {
                        closed = true;
                        break;
                    }
                    Err(_) => break,
                }
            }

            self.flush(&mut buffer).await;
            if closed {
                break;
            }
        }

        debug!("Queue {} shard {} stopped", self.queue, self.index);
    }

    async fn flush(&self, buffer: &mut Vec<Pending<T>>) {
        if buffer.is_empty() {
            return;
        }

        if self.sort {
            buffer.sort_by(|a, b| a.item.batch_cmp(&b.item));
        }

        let (items, waiters): (Vec<T>, Vec<_>) =
            buffer.drain(..).map(|p| (p.item, p.done)).unzip();
        let size = items.len();
        let start = Instant::now();

        let sink = self.sink.clone();
        let outcome = match tokio::task::spawn_blocking(move || sink.flush(&items)).await {
            Ok(result) => result,
            Err(e) => Err(SenseError::Internal(format!("flush task panicked: {}", e))),
        };

        match outcome {
            Ok(rows) => {
                self.stats.record_flush(size as u64, 0);
                debug!(
                    "Queue {} shard {} flushed {} items ({} rows) in {:?}",
                    self.queue,
                    self.index,
                    size,
                    rows,
                    start.elapsed()
                );
                for done in waiters {
                    let _ = done.send(Ok(()));
                }
            }
            Err(e) => {
                self.stats.record_flush(0, size as u64);
                error!(
                    "Queue {} shard {} failed to flush {} items: {}",
                    self.queue, self.index, size, e
                );
                let failure = e.to_persistence();
                for done in waiters {
                    let _ = done.send(Err(failure.to_persistence()));
                }
            }
        }
    }
}
