// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Deferred queue.
//!
//! The [`DeferredQueue`] accepts items from any number of producers and hands
//! them to a [`BatchProcessor`] in batches:
//!
//! ```text
//!  producers ── add() ──▶ PendingBuffer ──(swap)──▶ FlushBatch ──▶ processor.process()
//!                              ▲                        ▲
//!               count threshold│ Notify        interval │ tick / flush() / shutdown()
//! ```
//!
//! # Guarantees
//!
//! - The buffer is swapped out under its lock, so every accepted item is
//!   processed in exactly one batch.
//! - Flushes are serialized by a flush mutex; a manual flush racing the
//!   background loop waits for it and then takes whatever has accumulated.
//! - A failed batch is not retried: [`flush`](DeferredQueue::flush) returns
//!   the error, background failures are logged and published on
//!   [`subscribe_failures`](DeferredQueue::subscribe_failures).
//! - [`shutdown`](DeferredQueue::shutdown) stops the loop and flushes what is
//!   left (unless `flush_on_shutdown` is off).
//!
//! # Example
//!
//! ```rust,no_run
//! use deferred_queue::{
//!     DeferredQueue, DeferredQueueConfig, EntityBatchProcessor, InMemoryBulkStore, Entity,
//! };
//! use std::sync::Arc;
//!
//! #[derive(Clone)]
//! struct Event { id: Option<u64> }
//!
//! impl Entity for Event {
//!     type Key = u64;
//!     fn key(&self) -> Option<u64> { self.id }
//!     fn is_from_store(&self) -> bool { false }
//! }
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(InMemoryBulkStore::<Event>::new());
//! let queue = DeferredQueue::new(
//!     DeferredQueueConfig::default(),
//!     EntityBatchProcessor::<Event, _>::new(store.clone()),
//! );
//! queue.start().expect("start");
//!
//! queue.add(Event { id: Some(1) }).await.ok();
//! let rows = queue.flush().await.expect("flush");
//! assert_eq!(rows, 1);
//!
//! queue.shutdown().await.expect("shutdown");
//! # }
//! ```

mod types;
mod flush;
mod lifecycle;

pub use types::{AddError, FlushFailure, QueueError, QueueState, QueueStats};

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{info, warn};

use crate::backpressure::BackpressureLevel;
use crate::batching::PendingBuffer;
use crate::config::{DeferredQueueConfig, OverflowPolicy};
use crate::processor::BatchProcessor;

/// Buffer plus the closed flag, guarded together so closing and the final
/// swap happen under one lock.
pub(crate) struct Pending<T> {
    pub(crate) buffer: PendingBuffer<T>,
    pub(crate) closed: bool,
}

#[derive(Default)]
pub(crate) struct Counters {
    pub(crate) added: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) flushes: AtomicU64,
    pub(crate) failed_flushes: AtomicU64,
    pub(crate) items_flushed: AtomicU64,
    pub(crate) rows_affected: AtomicU64,
}

/// State shared between the queue handle and its background loop.
pub(crate) struct Shared<T, P> {
    pub(crate) config: DeferredQueueConfig,
    pub(crate) processor: P,
    pub(crate) pending: Mutex<Pending<T>>,
    /// Held across swap + process so only one flush runs at a time
    pub(crate) flush_lock: tokio::sync::Mutex<()>,
    /// Raised when a flush should run before the next tick
    pub(crate) flush_signal: Notify,
    /// Raised after every swap, wakes producers blocked on a full buffer
    pub(crate) space: Notify,
    pub(crate) state: watch::Sender<QueueState>,
    pub(crate) failures: broadcast::Sender<FlushFailure>,
    pub(crate) backpressure: AtomicU8,
    pub(crate) counters: Counters,
}

/// Thread-safe deferred batching queue.
///
/// Generic over the item type `T` and the [`BatchProcessor`] `P` that
/// persists each flushed batch. All methods take `&self`; share the queue
/// behind an `Arc` to add from several tasks.
pub struct DeferredQueue<T, P> {
    pub(crate) inner: Arc<Shared<T, P>>,
    pub(crate) worker: Mutex<Option<lifecycle::Worker>>,
}

impl<T, P> DeferredQueue<T, P>
where
    T: Send + 'static,
    P: BatchProcessor<T>,
{
    pub fn new(config: DeferredQueueConfig, processor: P) -> Self {
        let (state, _) = watch::channel(QueueState::Created);
        let (failures, _) = broadcast::channel(config.failure_channel_capacity.max(1));
        let buffer = PendingBuffer::new(config.flush_threshold());

        Self {
            inner: Arc::new(Shared {
                config,
                processor,
                pending: Mutex::new(Pending { buffer, closed: false }),
                flush_lock: tokio::sync::Mutex::new(()),
                flush_signal: Notify::new(),
                space: Notify::new(),
                state,
                failures,
                backpressure: AtomicU8::new(BackpressureLevel::Normal as u8),
                counters: Counters::default(),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Buffer an item without waiting.
    ///
    /// Fails with [`AddError::Full`] when `max_pending` is reached, whatever
    /// the overflow policy, and with [`AddError::Closed`] after shutdown.
    pub fn try_add(&self, item: T) -> Result<(), AddError<T>> {
        self.inner.push(item).map_err(|err| self.inner.rejected(err))
    }

    /// Buffer an item, applying the configured [`OverflowPolicy`] when full.
    ///
    /// Never waits on I/O. Under [`OverflowPolicy::Block`] it waits for the
    /// next flush to free space, which needs the background loop (or another
    /// caller of [`flush`](Self::flush)) to make progress.
    pub async fn add(&self, item: T) -> Result<(), AddError<T>> {
        if self.inner.config.overflow == OverflowPolicy::Reject {
            return self.try_add(item);
        }

        let mut item = item;
        loop {
            let space = self.inner.space.notified();
            tokio::pin!(space);
            // register before checking so a swap in between is not missed
            space.as_mut().enable();

            match self.inner.push(item) {
                Err(AddError::Full { item: returned, .. }) => {
                    item = returned;
                    self.inner.flush_signal.notify_one();
                    space.await;
                }
                Err(closed) => return Err(self.inner.rejected(closed)),
                Ok(()) => return Ok(()),
            }
        }
    }

    /// Buffer several items, stopping at the first refusal.
    pub async fn add_all(&self, items: impl IntoIterator<Item = T>) -> Result<usize, AddError<T>> {
        let mut added = 0;
        for item in items {
            self.add(item).await?;
            added += 1;
        }
        Ok(added)
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    #[must_use]
    pub fn config(&self) -> &DeferredQueueConfig {
        &self.inner.config
    }

    #[must_use]
    pub fn processor(&self) -> &P {
        &self.inner.processor
    }

    /// Items currently buffered
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.pending.lock().buffer.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle transitions
    pub fn state_receiver(&self) -> watch::Receiver<QueueState> {
        self.inner.state.subscribe()
    }

    #[must_use]
    pub fn backpressure(&self) -> BackpressureLevel {
        let pending = self.len();
        let config = &self.inner.config;
        BackpressureLevel::from_fill(
            pending,
            config.pending_cap(),
            config.backpressure_warn,
            config.backpressure_critical,
        )
    }

    /// Receive a [`FlushFailure`] for every failed background flush.
    ///
    /// Failures of explicit [`flush`](Self::flush) calls are returned to the
    /// caller instead.
    pub fn subscribe_failures(&self) -> broadcast::Receiver<FlushFailure> {
        self.inner.failures.subscribe()
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let c = &self.inner.counters;
        QueueStats {
            pending: self.len(),
            added: c.added.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            flushes: c.flushes.load(Ordering::Relaxed),
            failed_flushes: c.failed_flushes.load(Ordering::Relaxed),
            items_flushed: c.items_flushed.load(Ordering::Relaxed),
            rows_affected: c.rows_affected.load(Ordering::Relaxed),
        }
    }
}

impl<T, P> Shared<T, P> {
    fn push(&self, item: T) -> Result<(), AddError<T>> {
        let (signal, pending) = {
            let mut guard = self.pending.lock();
            if guard.closed {
                return Err(AddError::Closed { item });
            }
            if let Some(capacity) = self.config.pending_cap() {
                if guard.buffer.len() >= capacity {
                    return Err(AddError::Full { capacity, item });
                }
            }
            let signal = guard.buffer.push(item);
            (signal, guard.buffer.len())
        };

        self.counters.added.fetch_add(1, Ordering::Relaxed);
        crate::metrics::record_item_added(&self.config.name);
        crate::metrics::set_pending_items(&self.config.name, pending);
        self.update_backpressure(pending);

        if signal.is_some() {
            self.flush_signal.notify_one();
        }
        Ok(())
    }

    fn rejected(&self, err: AddError<T>) -> AddError<T> {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let cause = if err.is_full() { "full" } else { "closed" };
        crate::metrics::record_item_rejected(&self.config.name, cause);
        err
    }

    /// True when the loop should flush before its next tick
    pub(crate) fn wants_flush(&self) -> bool {
        let len = self.pending.lock().buffer.len();
        len >= self.config.flush_threshold()
            || self.config.pending_cap().is_some_and(|max| len >= max)
    }

    pub(crate) fn update_backpressure(&self, pending: usize) {
        let level = BackpressureLevel::from_fill(
            pending,
            self.config.pending_cap(),
            self.config.backpressure_warn,
            self.config.backpressure_critical,
        );
        let previous = self.backpressure.swap(level as u8, Ordering::Relaxed);
        if previous == level as u8 {
            return;
        }

        crate::metrics::set_backpressure_level(&self.config.name, level as u8);
        if level > BackpressureLevel::Normal {
            warn!(
                queue = %self.config.name,
                pending,
                level = %level,
                "{}", level.description()
            );
        } else {
            info!(queue = %self.config.name, pending, "Backpressure cleared");
        }
    }
}
