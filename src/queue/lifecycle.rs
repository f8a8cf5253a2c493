//! Queue lifecycle: start, background loop, shutdown.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::batching::FlushReason;
use crate::host::{CancelSignal, HostError, HostedService};
use crate::processor::BatchProcessor;

use super::{DeferredQueue, QueueError, QueueState, Shared};

pub(crate) struct Worker {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl<T, P> DeferredQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    /// Spawn the background flush loop on the current tokio runtime.
    ///
    /// Without a running loop items are only flushed by explicit
    /// [`flush`](Self::flush) and [`shutdown`](Self::shutdown) calls.
    pub fn start(&self) -> Result<(), QueueError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Err(QueueError::AlreadyStarted);
        }
        if self.inner.pending.lock().closed {
            return Err(QueueError::Closed);
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| QueueError::NoRuntime)?;

        let (stop, stop_rx) = watch::channel(false);
        let handle = runtime.spawn(run_loop(Arc::clone(&self.inner), stop_rx));
        *worker = Some(Worker { handle, stop });

        self.inner.state.send_replace(QueueState::Running);
        info!(
            queue = %self.inner.config.name,
            flush_ms = self.inner.config.flush_ms,
            flush_count = self.inner.config.flush_threshold(),
            max_pending = ?self.inner.config.pending_cap(),
            "Deferred queue started"
        );
        Ok(())
    }

    /// Stop the background loop, close the queue and flush what is left.
    ///
    /// Returns the rows affected by the final flush. Safe to call more than
    /// once; calls on a stopped queue return `Ok(0)` without touching the
    /// state watchers.
    #[tracing::instrument(skip(self), fields(queue = %self.inner.config.name))]
    pub async fn shutdown(&self) -> Result<usize, QueueError> {
        if self.state() == QueueState::Stopped {
            debug!("Deferred queue already stopped");
            return Ok(0);
        }

        let shutdown_start = std::time::Instant::now();
        self.inner.state.send_replace(QueueState::ShuttingDown);
        info!("Shutting down deferred queue");

        let worker = self.worker.lock().take();
        if let Some(Worker { handle, stop }) = worker {
            let _ = stop.send(true);
            if let Err(e) = handle.await {
                error!(error = %e, "Background flush loop ended abnormally");
            }
        }

        let pending = self.len();
        if pending > 0 && self.inner.config.flush_on_shutdown {
            info!(pending, "Flushing final batch on shutdown");
        }
        let result = self.inner.close_and_flush().await;

        self.inner.state.send_replace(QueueState::Stopped);
        match &result {
            Ok(rows) => info!(
                rows,
                elapsed_ms = shutdown_start.elapsed().as_millis() as u64,
                "Deferred queue shutdown complete"
            ),
            Err(e) => error!(error = %e, "Final flush failed during shutdown"),
        }
        result
    }
}

async fn run_loop<T, P>(inner: Arc<Shared<T, P>>, mut stop: watch::Receiver<bool>)
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    let mut interval = tokio::time::interval(inner.config.flush_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // first tick completes immediately
    interval.tick().await;

    loop {
        tokio::select! {
            biased;

            // Err means the queue handle is gone
            _ = stop.changed() => break,

            _ = inner.flush_signal.notified() => {
                // stale permits from an already-flushed threshold are ignored
                if inner.wants_flush() {
                    inner.flush_in_background(FlushReason::Count).await;
                }
            }

            _ = interval.tick() => {
                inner.flush_in_background(FlushReason::Time).await;
            }
        }
    }

    debug!(queue = %inner.config.name, "Background flush loop stopped");
}

impl<T, P> Drop for DeferredQueue<T, P> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.get_mut().take() {
            let _ = worker.stop.send(true);
        }
        let pending = self.inner.pending.lock();
        if !pending.closed && !pending.buffer.is_empty() {
            warn!(
                queue = %self.inner.config.name,
                lost = pending.buffer.len(),
                "Deferred queue dropped without shutdown, pending items lost"
            );
        }
    }
}

#[async_trait]
impl<T, P> HostedService for DeferredQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    fn name(&self) -> &str {
        &self.inner.config.name
    }

    async fn start(&self, _cancel: &CancelSignal) -> Result<(), HostError> {
        DeferredQueue::start(self).map_err(|e| HostError::service(self.name(), e))
    }

    async fn stop(&self, _cancel: &CancelSignal) -> Result<(), HostError> {
        self.shutdown()
            .await
            .map(|_| ())
            .map_err(|e| HostError::service(self.name(), e))
    }
}
