//! Flushing: swap the pending buffer out and hand it to the processor.

use std::sync::atomic::Ordering;
use tracing::{debug, error, warn};

use crate::batching::{FlushBatch, FlushReason};
use crate::metrics::LatencyTimer;
use crate::processor::BatchProcessor;

use super::{DeferredQueue, FlushFailure, QueueError, Shared};

impl<T, P> DeferredQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    /// Flush everything pending now and return the affected-row count.
    ///
    /// Waits for an in-flight flush to finish first. Returns `Ok(0)` without
    /// calling the processor when nothing is pending. On error the batch is
    /// gone from the queue; re-add items from the processor if they must
    /// survive.
    pub async fn flush(&self) -> Result<usize, QueueError> {
        self.inner.flush(FlushReason::Manual).await
    }
}

impl<T, P> Shared<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    pub(crate) async fn flush(&self, reason: FlushReason) -> Result<usize, QueueError> {
        let _serial = self.flush_lock.lock().await;

        let batch = self.pending.lock().buffer.take(reason);
        let Some(batch) = batch else {
            return Ok(0);
        };
        self.after_swap();
        self.process_batch(batch).await
    }

    /// Flush from the background loop; errors go to the log and the failure channel.
    pub(crate) async fn flush_in_background(&self, reason: FlushReason) {
        let Err(err) = self.flush(reason).await else {
            return;
        };

        let batch_size = match &err {
            QueueError::Processing { batch_size, .. } => *batch_size,
            _ => 0,
        };
        error!(
            queue = %self.config.name,
            reason = %reason,
            batch_size,
            error = %err,
            "Background flush failed, batch dropped"
        );
        // no subscribers is fine
        let _ = self.failures.send(FlushFailure {
            queue: self.config.name.clone(),
            reason,
            batch_size,
            error: err.to_string(),
        });
    }

    /// Close the queue and flush (or discard) the remainder in one step.
    pub(crate) async fn close_and_flush(&self) -> Result<usize, QueueError> {
        let _serial = self.flush_lock.lock().await;

        let batch = {
            let mut guard = self.pending.lock();
            guard.closed = true;
            if self.config.flush_on_shutdown {
                guard.buffer.take(FlushReason::Shutdown)
            } else {
                let discarded = guard.buffer.clear();
                if discarded > 0 {
                    warn!(queue = %self.config.name, discarded, "Discarding pending items on shutdown");
                    crate::metrics::record_items_discarded(&self.config.name, discarded);
                }
                None
            }
        };
        // also wakes blocked producers, which then see the queue closed
        self.after_swap();

        match batch {
            Some(batch) => self.process_batch(batch).await,
            None => Ok(0),
        }
    }

    fn after_swap(&self) {
        let pending = self.pending.lock().buffer.len();
        crate::metrics::set_pending_items(&self.config.name, pending);
        self.update_backpressure(pending);
        self.space.notify_waiters();
    }

    async fn process_batch(&self, batch: FlushBatch<T>) -> Result<usize, QueueError> {
        let FlushBatch { items, reason, age } = batch;
        let batch_size = items.len();
        let name = &self.config.name;

        crate::metrics::record_batch_size(name, batch_size);
        crate::metrics::record_batch_age(name, age);

        let timer = LatencyTimer::new(name);
        let result = self.processor.process(items).await;
        let elapsed = timer.elapsed();
        drop(timer);

        self.counters.flushes.fetch_add(1, Ordering::Relaxed);
        self.counters.items_flushed.fetch_add(batch_size as u64, Ordering::Relaxed);

        match result {
            Ok(rows) => {
                self.counters.rows_affected.fetch_add(rows as u64, Ordering::Relaxed);
                crate::metrics::record_flush(name, reason.as_str(), "success");
                crate::metrics::record_rows_affected(name, rows);
                debug!(
                    queue = %name,
                    reason = %reason,
                    batch_size,
                    rows,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Batch flushed"
                );
                Ok(rows)
            }
            Err(source) => {
                self.counters.failed_flushes.fetch_add(1, Ordering::Relaxed);
                crate::metrics::record_flush(name, reason.as_str(), "error");
                Err(QueueError::Processing {
                    reason,
                    batch_size,
                    source,
                })
            }
        }
    }
}
